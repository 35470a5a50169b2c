//! Identifier generation

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::{Result, SettlementError};

pub const LISTING: &str = "listing_";
pub const SERVICE: &str = "service_";
pub const OFFER: &str = "offer_";
pub const TRADE: &str = "trade_";
pub const SERVICE_RUN: &str = "run_";
pub const CHAT: &str = "chat_";
pub const MESSAGE: &str = "msg_";
pub const TRANSACTION: &str = "txn_";
pub const RATING: &str = "rating_";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String> {
    let hrp = bech32::Hrp::parse(hrp).map_err(|e| SettlementError::Codec(e.to_string()))?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| SettlementError::Codec(e.to_string()))?;
    Ok(encode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_valid_bech32_with_hrp() {
        let encoded = new_uuid_to_bech32(TRADE).unwrap();
        assert!(encoded.starts_with("trade_1"));
        assert!(encoded.len() > 10);
    }

    #[test]
    fn rejects_empty_hrp() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    #[test]
    fn generates_unique_ids() {
        let a = new_uuid_to_bech32(OFFER).unwrap();
        let b = new_uuid_to_bech32(OFFER).unwrap();
        assert_ne!(a, b);
    }
}
