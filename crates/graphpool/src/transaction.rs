//! Transaction-support level advertised to the enclosing transaction manager.

use std::fmt;

/// Declared transactional capability of a connection factory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionSupportLevel {
    NoTransaction,
    LocalTransaction,
    XaTransaction,
}

impl TransactionSupportLevel {
    /// Decide the level from the configured XA flag.
    ///
    /// Factories always support at least local transactions; `NoTransaction`
    /// exists for connections created outside a factory.
    pub fn negotiate(xa: bool) -> Self {
        if xa {
            TransactionSupportLevel::XaTransaction
        } else {
            TransactionSupportLevel::LocalTransaction
        }
    }

    pub fn is_distributed(self) -> bool {
        self == TransactionSupportLevel::XaTransaction
    }
}

impl fmt::Display for TransactionSupportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionSupportLevel::NoTransaction => write!(f, "none"),
            TransactionSupportLevel::LocalTransaction => write!(f, "local"),
            TransactionSupportLevel::XaTransaction => write!(f, "xa"),
        }
    }
}
