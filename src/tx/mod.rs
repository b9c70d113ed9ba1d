//! Transaction helpers: gas limits, fee selection and nonce allocation

mod gas;
mod nonce;

pub use gas::GasEstimator;
pub use nonce::NonceManager;
