//! Amount arithmetic.
//!
//! XMR amounts are decimals converted to piconero (1e12 per XMR) at the
//! wallet boundary; EVM amounts are decimals converted to the asset's
//! smallest unit at the escrow boundary. Exchange rates are XMR per whole
//! EVM unit.

use ethers::types::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PICONERO_DECIMALS: u32 = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount must be positive, got {0}")]
    NonPositive(Decimal),
    #[error("amount {0} has more precision than {1} decimals")]
    TooPrecise(Decimal, u32),
    #[error("amount {0} overflows the target unit")]
    Overflow(Decimal),
    #[error("exchange rate must be positive, got {0}")]
    InvalidRate(Decimal),
}

/// Converts a decimal XMR amount to piconero.
pub fn xmr_to_piconero(xmr: &Decimal) -> Result<u64, AmountError> {
    if !xmr.is_sign_positive() || xmr.is_zero() {
        return Err(AmountError::NonPositive(*xmr));
    }
    let scaled = xmr
        .checked_mul(Decimal::from(10u64.pow(PICONERO_DECIMALS)))
        .ok_or(AmountError::Overflow(*xmr))?;
    if scaled.fract() != Decimal::ZERO {
        return Err(AmountError::TooPrecise(*xmr, PICONERO_DECIMALS));
    }
    scaled.to_u64().ok_or(AmountError::Overflow(*xmr))
}

pub fn piconero_to_xmr(piconero: u64) -> Decimal {
    Decimal::from(piconero) / Decimal::from(10u64.pow(PICONERO_DECIMALS))
}

/// Converts a decimal asset amount to its smallest on-chain unit.
pub fn to_base_units(amount: &Decimal, decimals: u32) -> Result<U256, AmountError> {
    if !amount.is_sign_positive() || amount.is_zero() {
        return Err(AmountError::NonPositive(*amount));
    }
    if decimals > 28 {
        // Decimal's mantissa cannot scale past 28 digits.
        return Err(AmountError::Overflow(*amount));
    }
    let multiplier = Decimal::from_i128_with_scale(10i128.pow(decimals), 0);
    let scaled = amount
        .checked_mul(multiplier)
        .ok_or(AmountError::Overflow(*amount))?;
    if scaled.fract() != Decimal::ZERO {
        return Err(AmountError::TooPrecise(*amount, decimals));
    }
    U256::from_dec_str(&scaled.trunc().to_string()).map_err(|_| AmountError::Overflow(*amount))
}

/// XMR per one whole EVM asset unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate(Decimal);

impl ExchangeRate {
    pub fn new(rate: Decimal) -> Result<Self, AmountError> {
        if !rate.is_sign_positive() || rate.is_zero() {
            return Err(AmountError::InvalidRate(rate));
        }
        Ok(Self(rate))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// XMR received for a given EVM amount.
    pub fn xmr_for(&self, eth_amount: &Decimal) -> Result<Decimal, AmountError> {
        eth_amount
            .checked_mul(self.0)
            .ok_or(AmountError::Overflow(*eth_amount))
    }

    /// EVM amount owed for a given XMR amount.
    pub fn eth_for(&self, xmr_amount: &Decimal) -> Result<Decimal, AmountError> {
        xmr_amount
            .checked_div(self.0)
            .ok_or(AmountError::Overflow(*xmr_amount))
    }
}

impl std::fmt::Display for ExchangeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
