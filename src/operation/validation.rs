/// Stateless validation for ledger operations, kept apart from the type definitions
use crate::error::ChainError;
use crate::operation::types::{
    Amount, Deposit, Offer, OfferCancel, Signed, Transaction, Withdrawal, BASE_ASSET,
};

fn require_positive(what: &str, value: Amount) -> Result<(), ChainError> {
    if value <= Amount::ZERO {
        return Err(ChainError::InvalidOperation(format!(
            "{} must be greater than zero, got {}",
            what, value
        )));
    }
    Ok(())
}

fn require_non_empty(what: &str, value: &str) -> Result<(), ChainError> {
    if value.is_empty() {
        return Err(ChainError::InvalidOperation(format!("{} cannot be empty", what)));
    }
    Ok(())
}

impl Transaction {
    /// The reward shape is accepted without a signature; block validation
    /// decides whether it actually sits in the reward position.
    pub(crate) fn validate_fields(&self) -> Result<(), ChainError> {
        require_non_empty("Transaction asset", &self.asset)?;
        if self.outputs.is_empty() {
            return Err(ChainError::InvalidOperation(
                "Transaction must have at least one output".to_string(),
            ));
        }
        for output in &self.outputs {
            require_non_empty("Output wallet", &output.wallet)?;
            require_positive("Output size", output.size)?;
        }
        self.total_output()?;

        if self.is_reward_shaped() {
            return Ok(());
        }

        require_non_empty("Transaction wallet", &self.wallet)?;
        if self.outputs.iter().any(|o| o.wallet == self.wallet) {
            return Err(ChainError::InvalidOperation(
                "Transaction cannot pay its own wallet".to_string(),
            ));
        }
        self.verify_signature()
    }
}

impl Deposit {
    pub(crate) fn validate_fields(&self) -> Result<(), ChainError> {
        require_non_empty("Deposit target wallet", &self.target_wallet)?;
        require_non_empty("Deposit asset", &self.asset)?;
        require_non_empty("Deposit external hash", &self.tx_hash)?;
        require_positive("Deposit quantity", self.quantity)
    }
}

impl Withdrawal {
    pub(crate) fn validate_fields(&self) -> Result<(), ChainError> {
        require_non_empty("Withdrawal target wallet", &self.target_wallet)?;
        require_non_empty("Withdrawal asset", &self.asset)?;
        require_positive("Withdrawal size", self.size)?;
        self.verify_signature()
    }
}

impl Offer {
    pub(crate) fn validate_fields(&self) -> Result<(), ChainError> {
        require_non_empty("Offer asset", &self.asset)?;
        if self.asset == BASE_ASSET {
            return Err(ChainError::InvalidOperation(format!(
                "Offers cannot trade the base asset {} against itself",
                BASE_ASSET
            )));
        }
        require_positive("Offer price", self.price)?;
        require_positive("Offer quantity", self.quantity)?;
        self.price.checked_mul(self.quantity).ok_or_else(|| {
            ChainError::InvalidOperation(format!(
                "Offer value {} x {} out of range",
                self.price, self.quantity
            ))
        })?;
        self.verify_signature()
    }
}

impl OfferCancel {
    pub(crate) fn validate_fields(&self) -> Result<(), ChainError> {
        require_non_empty("Cancelled offer hash", &self.offer_hash)?;
        self.verify_signature()
    }
}
