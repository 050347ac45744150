//! ABI decoding of the three event kinds the crawler understands.
//!
//! Topics are matched against the Keccak-256 hash of the canonical event
//! signature. Indexed parameters live in `topics[1..]`, the rest are packed
//! as 32-byte words in `data`.

use once_cell::sync::Lazy;
use primitive_types::U256;
use sha3::{Digest, Keccak256};

use crate::{
    CrawlError, CrawlResult, DecodedEvent, ListingEvent, PurchaseEvent, RawLog, TokenEvent,
};

pub const TRANSFER_SIGNATURE: &str = "Transfer(address,address,uint256)";
pub const TOKEN_LISTED_SIGNATURE: &str = "TokenListed(address,uint256,uint256,uint256)";
pub const TOKEN_PURCHASED_SIGNATURE: &str = "TokenPurchased(address,address,uint256,uint256)";

pub static TRANSFER_TOPIC: Lazy<String> = Lazy::new(|| event_topic(TRANSFER_SIGNATURE));
pub static TOKEN_LISTED_TOPIC: Lazy<String> = Lazy::new(|| event_topic(TOKEN_LISTED_SIGNATURE));
pub static TOKEN_PURCHASED_TOPIC: Lazy<String> =
    Lazy::new(|| event_topic(TOKEN_PURCHASED_SIGNATURE));

/// `0x`-prefixed Keccak-256 hash of an event signature
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(Keccak256::digest(signature.as_bytes())))
}

/// First four bytes of the Keccak-256 hash of a function signature
pub fn function_selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn strip_hex(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

pub fn decode_hex(value: &str) -> CrawlResult<Vec<u8>> {
    hex::decode(strip_hex(value)).map_err(|e| CrawlError::Decode(format!("invalid hex: {}", e)))
}

fn word(bytes: &[u8], index: usize) -> CrawlResult<&[u8]> {
    bytes.get(index * 32..(index + 1) * 32).ok_or_else(|| {
        CrawlError::Decode(format!(
            "data too short for word {} ({} bytes)",
            index,
            bytes.len()
        ))
    })
}

/// Decode an address stored right-aligned in a 32-byte topic
pub fn topic_address(topic: &str) -> CrawlResult<String> {
    let bytes = decode_hex(topic)?;
    if bytes.len() != 32 {
        return Err(CrawlError::Decode(format!(
            "address topic must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(format!("0x{}", hex::encode(&bytes[12..])))
}

pub fn topic_u256(topic: &str) -> CrawlResult<U256> {
    let bytes = decode_hex(topic)?;
    Ok(U256::from_big_endian(word(&bytes, 0)?))
}

pub fn data_u256(data: &str, index: usize) -> CrawlResult<U256> {
    let bytes = decode_hex(data)?;
    Ok(U256::from_big_endian(word(&bytes, index)?))
}

/// Decode a single dynamic `string` return value
pub fn decode_abi_string(data: &str) -> CrawlResult<String> {
    let bytes = decode_hex(data)?;
    let offset = U256::from_big_endian(word(&bytes, 0)?);
    if offset > U256::from(bytes.len()) {
        return Err(CrawlError::Decode(format!("string offset {} out of range", offset)));
    }
    let offset = offset.as_usize();
    let len_word = bytes
        .get(offset..offset + 32)
        .ok_or_else(|| CrawlError::Decode("missing string length".to_string()))?;
    let len = U256::from_big_endian(len_word);
    if len > U256::from(bytes.len()) {
        return Err(CrawlError::Decode(format!("string length {} out of range", len)));
    }
    let start = offset + 32;
    let raw = bytes
        .get(start..start + len.as_usize())
        .ok_or_else(|| CrawlError::Decode("string body truncated".to_string()))?;
    String::from_utf8(raw.to_vec()).map_err(|e| CrawlError::Decode(e.to_string()))
}

/// Left-pad an address into a topic
pub fn encode_address_topic(address: &str) -> CrawlResult<String> {
    let bytes = decode_hex(address)?;
    if bytes.len() != 20 {
        return Err(CrawlError::Decode(format!(
            "address must be 20 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(format!("0x{}{}", "0".repeat(24), hex::encode(bytes)))
}

pub fn encode_u256_word(value: U256) -> String {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    hex::encode(buf)
}

/// Calldata for a function taking a single `uint256`
pub fn encode_call_u256(signature: &str, arg: U256) -> String {
    format!(
        "0x{}{}",
        hex::encode(function_selector(signature)),
        encode_u256_word(arg)
    )
}

pub fn parse_token_id(token_id: &str) -> CrawlResult<U256> {
    let parsed = match token_id.strip_prefix("0x") {
        Some(hex_value) => U256::from_str_radix(hex_value, 16).map_err(|e| format!("{:?}", e)),
        None => U256::from_dec_str(token_id).map_err(|e| format!("{:?}", e)),
    };
    parsed.map_err(|e| CrawlError::Decode(format!("invalid token id {}: {}", token_id, e)))
}

fn expect_topics(log: &RawLog, topic: &str, count: usize, name: &str) -> CrawlResult<()> {
    match log.topics.first() {
        Some(t) if t.eq_ignore_ascii_case(topic) => {}
        _ => return Err(CrawlError::Decode(format!("log is not a {} event", name))),
    }
    if log.topics.len() != count {
        return Err(CrawlError::Decode(format!(
            "{} expects {} topics, got {}",
            name,
            count,
            log.topics.len()
        )));
    }
    Ok(())
}

pub fn decode_transfer(chain_id: &str, log: &RawLog, timestamp: u64) -> CrawlResult<TokenEvent> {
    expect_topics(log, &TRANSFER_TOPIC, 4, "Transfer")?;
    Ok(TokenEvent {
        chain_id: chain_id.to_string(),
        contract_address: log.address.to_ascii_lowercase(),
        from: topic_address(&log.topics[1])?,
        to: topic_address(&log.topics[2])?,
        token_id: topic_u256(&log.topics[3])?.to_string(),
        transaction_hash: log.transaction_hash.clone(),
        log_index: log.log_index,
        block_number: log.block_number,
        timestamp,
    })
}

pub fn decode_listing(chain_id: &str, log: &RawLog, timestamp: u64) -> CrawlResult<ListingEvent> {
    expect_topics(log, &TOKEN_LISTED_TOPIC, 3, "TokenListed")?;
    Ok(ListingEvent {
        chain_id: chain_id.to_string(),
        contract_address: log.address.to_ascii_lowercase(),
        seller: topic_address(&log.topics[1])?,
        token_id: topic_u256(&log.topics[2])?.to_string(),
        price: data_u256(&log.data, 0)?.to_string(),
        quantity: data_u256(&log.data, 1)?.to_string(),
        transaction_hash: log.transaction_hash.clone(),
        log_index: log.log_index,
        block_number: log.block_number,
        timestamp,
    })
}

pub fn decode_purchase(
    chain_id: &str,
    log: &RawLog,
    timestamp: u64,
) -> CrawlResult<PurchaseEvent> {
    expect_topics(log, &TOKEN_PURCHASED_TOPIC, 4, "TokenPurchased")?;
    Ok(PurchaseEvent {
        chain_id: chain_id.to_string(),
        contract_address: log.address.to_ascii_lowercase(),
        buyer: topic_address(&log.topics[1])?,
        seller: topic_address(&log.topics[2])?,
        token_id: topic_u256(&log.topics[3])?.to_string(),
        quantity: data_u256(&log.data, 0)?.to_string(),
        transaction_hash: log.transaction_hash.clone(),
        log_index: log.log_index,
        block_number: log.block_number,
        timestamp,
    })
}

/// Decode a log against every known signature.
///
/// Returns `Ok(None)` for logs whose first topic matches none of them; a log
/// that matches a signature but is malformed is a decode error.
pub fn decode_log(chain_id: &str, log: &RawLog, timestamp: u64) -> CrawlResult<Option<DecodedEvent>> {
    let Some(topic) = log.topics.first() else {
        return Ok(None);
    };
    if topic.eq_ignore_ascii_case(&TRANSFER_TOPIC) {
        decode_transfer(chain_id, log, timestamp).map(|e| Some(DecodedEvent::Transfer(e)))
    } else if topic.eq_ignore_ascii_case(&TOKEN_LISTED_TOPIC) {
        decode_listing(chain_id, log, timestamp).map(|e| Some(DecodedEvent::Listing(e)))
    } else if topic.eq_ignore_ascii_case(&TOKEN_PURCHASED_TOPIC) {
        decode_purchase(chain_id, log, timestamp).map(|e| Some(DecodedEvent::Purchase(e)))
    } else {
        Ok(None)
    }
}

/// Builders for raw logs, used by adapters under test and by the mock chain.
pub mod encode {
    use super::*;

    fn raw(contract: &str, topics: Vec<String>, data: String, tx_hash: &str, log_index: u64, block: u64) -> RawLog {
        RawLog {
            address: contract.to_string(),
            topics,
            data: format!("0x{}", data),
            block_number: block,
            transaction_hash: tx_hash.to_string(),
            log_index,
        }
    }

    pub fn transfer_log(
        contract: &str,
        from: &str,
        to: &str,
        token_id: u64,
        tx_hash: &str,
        log_index: u64,
        block: u64,
    ) -> CrawlResult<RawLog> {
        Ok(raw(
            contract,
            vec![
                (*TRANSFER_TOPIC).clone(),
                encode_address_topic(from)?,
                encode_address_topic(to)?,
                format!("0x{}", encode_u256_word(U256::from(token_id))),
            ],
            String::new(),
            tx_hash,
            log_index,
            block,
        ))
    }

    pub fn listing_log(
        contract: &str,
        seller: &str,
        token_id: u64,
        price: U256,
        quantity: u64,
        tx_hash: &str,
        log_index: u64,
        block: u64,
    ) -> CrawlResult<RawLog> {
        Ok(raw(
            contract,
            vec![
                (*TOKEN_LISTED_TOPIC).clone(),
                encode_address_topic(seller)?,
                format!("0x{}", encode_u256_word(U256::from(token_id))),
            ],
            format!(
                "{}{}",
                encode_u256_word(price),
                encode_u256_word(U256::from(quantity))
            ),
            tx_hash,
            log_index,
            block,
        ))
    }

    pub fn purchase_log(
        contract: &str,
        buyer: &str,
        seller: &str,
        token_id: u64,
        quantity: u64,
        tx_hash: &str,
        log_index: u64,
        block: u64,
    ) -> CrawlResult<RawLog> {
        Ok(raw(
            contract,
            vec![
                (*TOKEN_PURCHASED_TOPIC).clone(),
                encode_address_topic(buyer)?,
                encode_address_topic(seller)?,
                format!("0x{}", encode_u256_word(U256::from(token_id))),
            ],
            encode_u256_word(U256::from(quantity)),
            tx_hash,
            log_index,
            block,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::encode::*;
    use super::*;

    const CONTRACT: &str = "0x5555555555555555555555555555555555555555";
    const ALICE: &str = "0x1111111111111111111111111111111111111111";
    const BOB: &str = "0x2222222222222222222222222222222222222222";

    #[test]
    fn test_known_topic_and_selector_values() {
        assert_eq!(
            TRANSFER_TOPIC.as_str(),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
        assert_eq!(hex::encode(function_selector("tokenURI(uint256)")), "c87b56dd");
        assert_eq!(hex::encode(function_selector("name()")), "06fdde03");
        assert_eq!(hex::encode(function_selector("symbol()")), "95d89b41");
    }

    #[test]
    fn test_decode_transfer() {
        let log = transfer_log(CONTRACT, ALICE, BOB, 77, "0xaa", 3, 120).unwrap();
        let event = decode_transfer("ethereum", &log, 1_700_000_000).unwrap();
        assert_eq!(event.from, ALICE);
        assert_eq!(event.to, BOB);
        assert_eq!(event.token_id, "77");
        assert_eq!(event.log_index, 3);
        assert_eq!(event.block_number, 120);
        assert_eq!(event.timestamp, 1_700_000_000);
    }

    #[test]
    fn test_decode_listing_reads_price_and_quantity_from_data() {
        let price = U256::from_dec_str("1500000000000000000").unwrap();
        let log = listing_log(CONTRACT, ALICE, 9, price, 2, "0xbb", 0, 5).unwrap();
        match decode_log("polygon", &log, 10).unwrap() {
            Some(DecodedEvent::Listing(listing)) => {
                assert_eq!(listing.seller, ALICE);
                assert_eq!(listing.token_id, "9");
                assert_eq!(listing.price, "1500000000000000000");
                assert_eq!(listing.quantity, "2");
            }
            other => panic!("expected listing, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_purchase() {
        let log = purchase_log(CONTRACT, BOB, ALICE, 4, 1, "0xcc", 1, 6).unwrap();
        match decode_log("bsc", &log, 0).unwrap() {
            Some(DecodedEvent::Purchase(purchase)) => {
                assert_eq!(purchase.buyer, BOB);
                assert_eq!(purchase.seller, ALICE);
                assert_eq!(purchase.quantity, "1");
            }
            other => panic!("expected purchase, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_topic_is_not_an_error() {
        let mut log = transfer_log(CONTRACT, ALICE, BOB, 1, "0xdd", 0, 1).unwrap();
        log.topics[0] = event_topic("Approval(address,address,uint256)");
        assert!(decode_log("ethereum", &log, 0).unwrap().is_none());
    }

    #[test]
    fn test_erc20_style_transfer_is_a_decode_error() {
        let mut log = transfer_log(CONTRACT, ALICE, BOB, 1, "0xee", 0, 1).unwrap();
        log.topics.pop();
        assert!(matches!(
            decode_log("ethereum", &log, 0),
            Err(CrawlError::Decode(_))
        ));
    }

    #[test]
    fn test_truncated_listing_data_is_a_decode_error() {
        let mut log = listing_log(CONTRACT, ALICE, 1, U256::one(), 1, "0xff", 0, 1).unwrap();
        log.data = "0x00".to_string();
        assert!(decode_log("ethereum", &log, 0).is_err());
    }

    #[test]
    fn test_decode_abi_string() {
        let text = "ipfs://QmToken/1.json";
        let mut data = encode_u256_word(U256::from(32));
        data.push_str(&encode_u256_word(U256::from(text.len())));
        let mut body = hex::encode(text.as_bytes());
        while body.len() % 64 != 0 {
            body.push('0');
        }
        data.push_str(&body);
        assert_eq!(decode_abi_string(&format!("0x{}", data)).unwrap(), text);
    }

    #[test]
    fn test_parse_token_id_accepts_hex_and_decimal() {
        assert_eq!(parse_token_id("255").unwrap(), U256::from(255));
        assert_eq!(parse_token_id("0xff").unwrap(), U256::from(255));
        assert!(parse_token_id("not-a-number").is_err());
    }
}
