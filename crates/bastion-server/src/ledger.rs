//! In-memory account ledger
//!
//! Business operations run here once a session is established. Failures
//! are outcomes for the caller, not protocol errors.

use bastion_crypto::{constant_time_eq, hash_password};
use bastion_protocol::{Operation, Outcome};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

struct Account {
    password_hash: String,
    balance: i64,
}

#[derive(Default)]
pub struct Ledger {
    accounts: Mutex<HashMap<String, Account>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an account from a plain password, replacing any existing one
    pub fn seed(&self, holder: &str, password: &str, balance: i64) {
        self.accounts.lock().insert(
            holder.to_string(),
            Account {
                password_hash: hash_password(password),
                balance,
            },
        );
        info!("Seeded account {}", holder);
    }

    pub fn len(&self) -> usize {
        self.accounts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one operation
    pub fn execute(&self, operation: &Operation) -> Outcome {
        let mut accounts = self.accounts.lock();
        match operation {
            Operation::Balance {
                holder,
                password_hash,
            } => match authorize(&accounts, holder, password_hash) {
                Ok(account) => Outcome::Balance {
                    balance: account.balance.to_string(),
                },
                Err(outcome) => outcome,
            },
            Operation::CreateAccount {
                holder,
                password_hash,
                initial_deposit,
            } => {
                if holder.is_empty() {
                    return rejected("holder cannot be empty");
                }
                if *initial_deposit < 0 {
                    return rejected("initial deposit cannot be negative");
                }
                if accounts.contains_key(holder) {
                    return rejected("account already exists");
                }
                accounts.insert(
                    holder.clone(),
                    Account {
                        password_hash: password_hash.clone(),
                        balance: *initial_deposit,
                    },
                );
                debug!("Created account {}", holder);
                Outcome::AccountCreated {
                    holder: holder.clone(),
                }
            }
            Operation::Deposit {
                holder,
                password_hash,
                amount,
            } => {
                if *amount <= 0 {
                    return rejected("deposit must be positive");
                }
                if let Err(outcome) = authorize(&accounts, holder, password_hash) {
                    return outcome;
                }
                let Some(account) = accounts.get_mut(holder) else {
                    return rejected("unknown account");
                };
                match account.balance.checked_add(*amount) {
                    Some(balance) => {
                        account.balance = balance;
                        Outcome::Deposited {
                            balance: balance.to_string(),
                        }
                    }
                    None => rejected("balance overflow"),
                }
            }
        }
    }
}

fn authorize<'a>(
    accounts: &'a HashMap<String, Account>,
    holder: &str,
    password_hash: &str,
) -> Result<&'a Account, Outcome> {
    // Same answer for unknown holder and wrong password
    match accounts.get(holder) {
        Some(account)
            if constant_time_eq(account.password_hash.as_bytes(), password_hash.as_bytes()) =>
        {
            Ok(account)
        }
        _ => Err(rejected("invalid credentials")),
    }
}

fn rejected(reason: &str) -> Outcome {
    Outcome::Rejected {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(ledger: &Ledger, holder: &str, password: &str) -> Outcome {
        ledger.execute(&Operation::Balance {
            holder: holder.into(),
            password_hash: hash_password(password),
        })
    }

    #[test]
    fn test_seeded_balance() {
        let ledger = Ledger::new();
        ledger.seed("alice", "pw", 120);

        assert_eq!(
            balance(&ledger, "alice", "pw"),
            Outcome::Balance {
                balance: "120".into()
            }
        );
    }

    #[test]
    fn test_wrong_password_and_unknown_holder_look_alike() {
        let ledger = Ledger::new();
        ledger.seed("alice", "pw", 120);

        assert_eq!(balance(&ledger, "alice", "nope"), balance(&ledger, "bob", "pw"));
        assert!(matches!(balance(&ledger, "bob", "pw"), Outcome::Rejected { .. }));
    }

    #[test]
    fn test_create_then_deposit() {
        let ledger = Ledger::new();
        let created = ledger.execute(&Operation::CreateAccount {
            holder: "carol".into(),
            password_hash: hash_password("secret"),
            initial_deposit: 10,
        });
        assert_eq!(created, Outcome::AccountCreated { holder: "carol".into() });

        let deposited = ledger.execute(&Operation::Deposit {
            holder: "carol".into(),
            password_hash: hash_password("secret"),
            amount: 15,
        });
        assert_eq!(deposited, Outcome::Deposited { balance: "25".into() });

        // Duplicate holder
        let again = ledger.execute(&Operation::CreateAccount {
            holder: "carol".into(),
            password_hash: hash_password("other"),
            initial_deposit: 0,
        });
        assert!(matches!(again, Outcome::Rejected { .. }));
    }

    #[test]
    fn test_invalid_amounts() {
        let ledger = Ledger::new();
        ledger.seed("alice", "pw", i64::MAX - 1);

        let zero = ledger.execute(&Operation::Deposit {
            holder: "alice".into(),
            password_hash: hash_password("pw"),
            amount: 0,
        });
        assert!(matches!(zero, Outcome::Rejected { .. }));

        let overflow = ledger.execute(&Operation::Deposit {
            holder: "alice".into(),
            password_hash: hash_password("pw"),
            amount: 5,
        });
        assert!(matches!(overflow, Outcome::Rejected { .. }));

        let negative = ledger.execute(&Operation::CreateAccount {
            holder: "dave".into(),
            password_hash: hash_password("pw"),
            initial_deposit: -1,
        });
        assert!(matches!(negative, Outcome::Rejected { .. }));
        assert_eq!(ledger.len(), 1);
    }
}
