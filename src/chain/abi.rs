//! Fund ABI Surface
//!
//! Call encoding and return/log decoding for the fixed set of contract
//! functions and events the dashboard uses. Only static 32-byte words and
//! dynamic arrays of static tuples are supported, which covers every
//! signature below. Amounts wider than 128 bits are rejected.

use super::{ChainError, ChainResult, ContractEvent};
use crate::types::{
    Address, BadgeLevel, InvestmentCategory, Investment, InvestorStats, LockDuration,
    PerformancePoint, TxHash,
};
use crate::units::{BaseUnits, DECIMALS};
use sha3::{Digest, Keccak256};

/// One 32-byte ABI word
pub type Word = [u8; 32];

/// Canonical signatures of the functions and events the dashboard uses
pub mod signature {
    pub const CREATE_LOCKED_INVESTMENT: &str = "createLockedInvestment(uint256,uint256,uint8)";
    pub const WITHDRAW: &str = "withdraw(uint256)";
    pub const GET_INVESTOR_STATS: &str = "getInvestorStats(address)";
    pub const GET_INVESTOR_INVESTMENTS: &str = "getInvestorInvestments(address)";
    pub const GET_HISTORICAL_PERFORMANCE: &str = "getHistoricalPerformance(uint256)";
    pub const APPROVE: &str = "approve(address,uint256)";
    pub const BALANCE_OF: &str = "balanceOf(address)";

    pub const BADGE_LEVEL_CHANGE: &str = "BadgeLevelChange(address,uint8,uint8)";
    pub const INVESTMENT_PERFORMANCE: &str =
        "InvestmentPerformance(address,uint256,uint256,uint256,uint256)";
    pub const WITHDRAWAL: &str = "WithdrawalEvent(address,uint256,uint256)";
    pub const NEW_PEAK_TVL: &str = "NewPeakTVL(uint256,uint256)";
    pub const PERFORMANCE_UPDATE: &str = "PerformanceUpdate(uint256,uint256,int256,uint256)";
}

/// 4-byte function selector: leading bytes of keccak256 of the signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Log topic of an event: keccak256 of its signature, 0x-prefixed lowercase hex
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(Keccak256::digest(signature.as_bytes())))
}

/// Event topics, as matched against `eth_getLogs` results
///
/// Kept as literals so they can be used as match patterns; each equals
/// `event_topic` of the matching entry in [`signature`].
pub mod topic {
    /// BadgeLevelChange(address,uint8,uint8)
    pub const BADGE_LEVEL_CHANGE: &str =
        "0x1331052bd0fe7e8d2e6974f9ed28d7cd752e12b59f895409db6dca020a7f5b09";
    /// InvestmentPerformance(address,uint256,uint256,uint256,uint256)
    pub const INVESTMENT_PERFORMANCE: &str =
        "0x66612cc1443bc485efd3b979e2380c2053eabc156f5a9dd908b35c4c79b1bdeb";
    /// WithdrawalEvent(address,uint256,uint256)
    pub const WITHDRAWAL: &str =
        "0xbda29a9e6b4ed78b3ef7f48ca275518ddc1404cc7fb70813569407d029e59902";
    /// NewPeakTVL(uint256,uint256)
    pub const NEW_PEAK_TVL: &str =
        "0x3a48cd28870963538807f4344fd39cff2d0e78f7bd750e0cead1989e44cc861f";
    /// PerformanceUpdate(uint256,uint256,int256,uint256)
    pub const PERFORMANCE_UPDATE: &str =
        "0x306d4c3a8197d0abb0645449bf237241e1fab389e81990398a48132c08b2495d";

    /// Every topic the event watcher filters on
    pub const ALL: [&str; 5] = [
        BADGE_LEVEL_CHANGE,
        INVESTMENT_PERFORMANCE,
        WITHDRAWAL,
        NEW_PEAK_TVL,
        PERFORMANCE_UPDATE,
    ];
}

// ============================================
// Encoding
// ============================================

pub fn uint_word(value: u128) -> Word {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

pub fn address_word(address: &Address) -> Word {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(&address.to_bytes());
    word
}

/// Hex calldata: selector followed by head words
pub fn encode_call(selector: [u8; 4], args: &[Word]) -> String {
    let mut data = Vec::with_capacity(4 + args.len() * 32);
    data.extend_from_slice(&selector);
    for arg in args {
        data.extend_from_slice(arg);
    }
    format!("0x{}", hex::encode(data))
}

/// Hex encoding of raw words, as found in return data and log data
pub fn encode_words(words: &[Word]) -> String {
    format!("0x{}", hex::encode(words.concat()))
}

pub fn create_locked_investment_call(
    amount: BaseUnits,
    lock_duration: LockDuration,
    category: InvestmentCategory,
) -> String {
    encode_call(
        selector(signature::CREATE_LOCKED_INVESTMENT),
        &[
            uint_word(amount.raw()),
            uint_word(lock_duration.as_secs() as u128),
            uint_word(category.code() as u128),
        ],
    )
}

pub fn withdraw_call(amount: BaseUnits) -> String {
    encode_call(selector(signature::WITHDRAW), &[uint_word(amount.raw())])
}

pub fn investor_stats_call(investor: &Address) -> String {
    encode_call(selector(signature::GET_INVESTOR_STATS), &[address_word(investor)])
}

pub fn investor_investments_call(investor: &Address) -> String {
    encode_call(selector(signature::GET_INVESTOR_INVESTMENTS), &[address_word(investor)])
}

pub fn historical_performance_call(days: u32) -> String {
    encode_call(selector(signature::GET_HISTORICAL_PERFORMANCE), &[uint_word(days as u128)])
}

pub fn approve_call(spender: &Address, amount: BaseUnits) -> String {
    encode_call(selector(signature::APPROVE), &[address_word(spender), uint_word(amount.raw())])
}

pub fn balance_of_call(owner: &Address) -> String {
    encode_call(selector(signature::BALANCE_OF), &[address_word(owner)])
}

// ============================================
// Decoding
// ============================================

/// Return or log data split into 32-byte words
#[derive(Debug, Clone)]
pub struct Words(Vec<Word>);

impl Words {
    pub fn from_hex(data: &str) -> ChainResult<Self> {
        let digits = data.trim().trim_start_matches("0x");
        let bytes = hex::decode(digits).map_err(|e| ChainError::Decode(e.to_string()))?;
        if bytes.len() % 32 != 0 {
            return Err(ChainError::Decode(format!(
                "data length {} is not a multiple of 32",
                bytes.len()
            )));
        }

        let words = bytes
            .chunks_exact(32)
            .map(|chunk| {
                let mut word = [0u8; 32];
                word.copy_from_slice(chunk);
                word
            })
            .collect();
        Ok(Self(words))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn word(&self, index: usize) -> ChainResult<&Word> {
        self.0
            .get(index)
            .ok_or_else(|| ChainError::Decode(format!("missing word {}", index)))
    }

    /// Unsigned integer that must fit in 128 bits
    pub fn uint(&self, index: usize) -> ChainResult<u128> {
        word_to_u128(self.word(index)?)
    }

    pub fn u64(&self, index: usize) -> ChainResult<u64> {
        let value = self.uint(index)?;
        u64::try_from(value)
            .map_err(|_| ChainError::Decode(format!("word {} exceeds u64: {}", index, value)))
    }

    pub fn u8(&self, index: usize) -> ChainResult<u8> {
        let value = self.uint(index)?;
        u8::try_from(value)
            .map_err(|_| ChainError::Decode(format!("word {} exceeds u8: {}", index, value)))
    }

    pub fn units(&self, index: usize) -> ChainResult<BaseUnits> {
        self.uint(index).map(BaseUnits::new)
    }

    /// Signed 18-decimal fixed-point value as a float
    pub fn signed_decimal(&self, index: usize) -> ChainResult<f64> {
        let word = self.word(index)?;
        let mut low = [0u8; 16];
        low.copy_from_slice(&word[16..]);
        let value = i128::from_be_bytes(low);

        let high = &word[..16];
        let fits = (value >= 0 && high.iter().all(|b| *b == 0))
            || (value < 0 && high.iter().all(|b| *b == 0xff));
        if !fits {
            return Err(ChainError::Decode(format!("word {} exceeds int128", index)));
        }

        Ok(value as f64 / 10f64.powi(DECIMALS as i32))
    }

    pub fn address(&self, index: usize) -> ChainResult<Address> {
        word_to_address(self.word(index)?)
    }

    /// Locate a dynamic array whose offset is stored at `head`.
    ///
    /// Returns the index of the first element word and the element count;
    /// bounds are checked for elements of `stride` words each.
    pub fn array(&self, head: usize, stride: usize) -> ChainResult<(usize, usize)> {
        let offset = self.u64(head)? as usize;
        if offset % 32 != 0 {
            return Err(ChainError::Decode(format!("unaligned array offset {}", offset)));
        }

        let length_index = offset / 32;
        let length = self.u64(length_index)? as usize;
        let start = length_index + 1;
        let end = length
            .checked_mul(stride)
            .and_then(|n| n.checked_add(start))
            .ok_or_else(|| ChainError::Decode("array length overflow".to_string()))?;

        if end > self.len() {
            return Err(ChainError::Decode(format!(
                "array of {} elements runs past end of data",
                length
            )));
        }

        Ok((start, length))
    }
}

fn word_to_u128(word: &Word) -> ChainResult<u128> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("value exceeds 128 bits".to_string()));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

fn word_to_address(word: &Word) -> ChainResult<Address> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("dirty address padding".to_string()));
    }
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&word[12..]);
    Ok(Address::from_bytes(bytes))
}

fn topic_word(topic: &str) -> ChainResult<Word> {
    let words = Words::from_hex(topic)?;
    if words.len() != 1 {
        return Err(ChainError::Decode(format!("malformed topic {}", topic)));
    }
    Ok(*words.word(0)?)
}

fn decode_err<E: std::fmt::Display>(e: E) -> ChainError {
    ChainError::Decode(e.to_string())
}

/// Single uint256 return value (e.g. `balanceOf`)
pub fn decode_units(data: &str) -> ChainResult<BaseUnits> {
    Words::from_hex(data)?.units(0)
}

/// `getInvestorStats` returns a static 7-word tuple
pub fn decode_investor_stats(data: &str) -> ChainResult<InvestorStats> {
    let words = Words::from_hex(data)?;
    Ok(InvestorStats {
        total_invested: words.units(0)?,
        current_total: words.units(1)?,
        unrealized_profit: words.units(2)?,
        realized_profit: words.units(3)?,
        total_fee_paid: words.units(4)?,
        badge_level: BadgeLevel::from_code(words.u8(5)?).map_err(decode_err)?,
        investment_count: words.u64(6)?,
    })
}

/// `getInvestorInvestments` returns `(uint256,uint256,uint256,uint256,uint8)[]`
pub fn decode_investments(data: &str) -> ChainResult<Vec<Investment>> {
    const STRIDE: usize = 5;

    let words = Words::from_hex(data)?;
    let (start, length) = words.array(0, STRIDE)?;

    (0..length)
        .map(|i| {
            let base = start + i * STRIDE;
            Ok(Investment {
                amount: words.units(base)?,
                current_value: words.units(base + 1)?,
                lock_duration: LockDuration::from_secs(words.u64(base + 2)?),
                start_time: words.u64(base + 3)?,
                category: InvestmentCategory::from_code(words.u8(base + 4)?).map_err(decode_err)?,
            })
        })
        .collect()
}

/// `getHistoricalPerformance` returns `(uint256[] timestamps, uint256[] values)`
pub fn decode_performance(data: &str) -> ChainResult<Vec<PerformancePoint>> {
    let words = Words::from_hex(data)?;
    let (ts_start, ts_len) = words.array(0, 1)?;
    let (val_start, val_len) = words.array(1, 1)?;

    if ts_len != val_len {
        return Err(ChainError::Decode(format!(
            "performance series length mismatch: {} timestamps, {} values",
            ts_len, val_len
        )));
    }

    (0..ts_len)
        .map(|i| {
            Ok(PerformancePoint {
                timestamp: words.u64(ts_start + i)?,
                value: words.units(val_start + i)?,
            })
        })
        .collect()
}

/// Decode one log entry. Logs with an unrecognized first topic yield `None`.
pub fn decode_log(
    topics: &[String],
    data: &str,
    tx_hash: Option<TxHash>,
) -> ChainResult<Option<ContractEvent>> {
    let Some(signature) = topics.first() else {
        return Ok(None);
    };
    let signature = signature.to_ascii_lowercase();
    let words = Words::from_hex(data)?;

    let indexed = |i: usize| -> ChainResult<Word> {
        topics
            .get(i)
            .ok_or_else(|| ChainError::Decode(format!("missing topic {}", i)))
            .and_then(|t| topic_word(t))
    };

    let event = match signature.as_str() {
        topic::BADGE_LEVEL_CHANGE => ContractEvent::BadgeLevelChange {
            investor: word_to_address(&indexed(1)?)?,
            previous: BadgeLevel::from_code(words.u8(0)?).map_err(decode_err)?,
            new: BadgeLevel::from_code(words.u8(1)?).map_err(decode_err)?,
        },
        topic::INVESTMENT_PERFORMANCE => {
            let id = word_to_u128(&indexed(2)?)?;
            ContractEvent::InvestmentPerformance {
                investor: word_to_address(&indexed(1)?)?,
                investment_id: u64::try_from(id).map_err(decode_err)?,
                previous_value: words.units(0)?,
                new_value: words.units(1)?,
                timestamp: words.u64(2)?,
            }
        }
        topic::WITHDRAWAL => ContractEvent::Withdrawal {
            investor: word_to_address(&indexed(1)?)?,
            amount: words.units(0)?,
            timestamp: words.u64(1)?,
            tx_hash,
        },
        topic::NEW_PEAK_TVL => ContractEvent::NewPeakTvl {
            timestamp: words.u64(0)?,
            amount: words.units(1)?,
        },
        topic::PERFORMANCE_UPDATE => ContractEvent::PerformanceUpdate {
            timestamp: words.u64(0)?,
            total_value: words.units(1)?,
            daily_change: words.signed_decimal(2)?,
            active_investors: words.u64(3)?,
        },
        _ => return Ok(None),
    };

    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn investor() -> Address {
        Address::parse("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap()
    }

    fn topic_of(word: Word) -> String {
        encode_words(&[word])
    }

    #[test]
    fn test_selectors_match_known_values() {
        assert_eq!(selector(signature::APPROVE), [0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(selector(signature::BALANCE_OF), [0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(selector(signature::WITHDRAW), [0x2e, 0x1a, 0x7d, 0x4d]);
        assert_eq!(
            selector(signature::CREATE_LOCKED_INVESTMENT),
            [0x6b, 0x54, 0x4c, 0x11]
        );
    }

    #[test]
    fn test_topic_literals_match_signatures() {
        let pairs = [
            (topic::BADGE_LEVEL_CHANGE, signature::BADGE_LEVEL_CHANGE),
            (topic::INVESTMENT_PERFORMANCE, signature::INVESTMENT_PERFORMANCE),
            (topic::WITHDRAWAL, signature::WITHDRAWAL),
            (topic::NEW_PEAK_TVL, signature::NEW_PEAK_TVL),
            (topic::PERFORMANCE_UPDATE, signature::PERFORMANCE_UPDATE),
        ];
        for (literal, signature) in pairs {
            assert_eq!(literal, event_topic(signature), "{}", signature);
        }
    }

    #[test]
    fn test_encode_withdraw_call() {
        let data = withdraw_call(BaseUnits::from_whole(1));
        assert!(data.starts_with("0x2e1a7d4d"));
        assert_eq!(data.len(), 2 + 8 + 64);
        assert!(data.ends_with("0de0b6b3a7640000"));
    }

    #[test]
    fn test_encode_create_locked_investment() {
        let data = create_locked_investment_call(
            BaseUnits::from_whole(100),
            LockDuration::from_secs(2_592_000),
            InvestmentCategory::Stocks,
        );
        assert!(data.starts_with("0x6b544c11"));
        assert_eq!(data.len(), 2 + 8 + 3 * 64);
        // category is the last word
        assert!(data.ends_with(&format!("{:064x}", 1)));
        assert!(data.contains(&format!("{:064x}", 2_592_000)));
    }

    #[test]
    fn test_encode_address_argument() {
        let data = balance_of_call(&investor());
        assert!(data.starts_with("0x70a08231"));
        assert!(data.ends_with("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"));
    }

    #[test]
    fn test_decode_investor_stats() {
        let data = encode_words(&[
            uint_word(BaseUnits::from_whole(1000).raw()),
            uint_word(BaseUnits::from_whole(1100).raw()),
            uint_word(BaseUnits::from_whole(100).raw()),
            uint_word(0),
            uint_word(BaseUnits::parse("2.5").unwrap().raw()),
            uint_word(2),
            uint_word(3),
        ]);

        let stats = decode_investor_stats(&data).unwrap();
        assert_eq!(stats.total_invested, BaseUnits::from_whole(1000));
        assert_eq!(stats.current_total, BaseUnits::from_whole(1100));
        assert_eq!(stats.total_fee_paid.to_string(), "2.5");
        assert_eq!(stats.badge_level, BadgeLevel::Gold);
        assert_eq!(stats.investment_count, 3);
    }

    #[test]
    fn test_decode_rejects_wide_values() {
        let mut wide = [0u8; 32];
        wide[0] = 1;
        let data = encode_words(&[wide]);
        assert!(matches!(decode_units(&data), Err(ChainError::Decode(_))));
        assert!(decode_units("0x1234").is_err());
    }

    #[test]
    fn test_decode_investments_array() {
        let data = encode_words(&[
            uint_word(0x20),
            uint_word(2),
            uint_word(BaseUnits::from_whole(100).raw()),
            uint_word(BaseUnits::from_whole(105).raw()),
            uint_word(2_592_000),
            uint_word(1_700_000_000),
            uint_word(0),
            uint_word(BaseUnits::from_whole(50).raw()),
            uint_word(BaseUnits::from_whole(45).raw()),
            uint_word(7_776_000),
            uint_word(1_700_100_000),
            uint_word(3),
        ]);

        let investments = decode_investments(&data).unwrap();
        assert_eq!(investments.len(), 2);
        assert_eq!(investments[0].category, InvestmentCategory::Crypto);
        assert_eq!(investments[0].lock_duration.as_days(), 30);
        assert_eq!(investments[1].category, InvestmentCategory::Bonds);
        assert_eq!(investments[1].current_value, BaseUnits::from_whole(45));
    }

    #[test]
    fn test_decode_truncated_array() {
        let data = encode_words(&[uint_word(0x20), uint_word(3), uint_word(1)]);
        assert!(decode_investments(&data).is_err());
    }

    #[test]
    fn test_decode_performance_series() {
        let data = encode_words(&[
            uint_word(0x40),
            uint_word(0xa0),
            uint_word(2),
            uint_word(1_000),
            uint_word(2_000),
            uint_word(2),
            uint_word(BaseUnits::from_whole(10).raw()),
            uint_word(BaseUnits::from_whole(12).raw()),
        ]);

        let points = decode_performance(&data).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].timestamp, 2_000);
        assert_eq!(points[1].value, BaseUnits::from_whole(12));
    }

    #[test]
    fn test_decode_badge_log() {
        let topics = vec![
            topic::BADGE_LEVEL_CHANGE.to_string(),
            topic_of(address_word(&investor())),
        ];
        let data = encode_words(&[uint_word(0), uint_word(1)]);

        let event = decode_log(&topics, &data, None).unwrap().unwrap();
        assert_eq!(
            event,
            ContractEvent::BadgeLevelChange {
                investor: investor(),
                previous: BadgeLevel::Bronze,
                new: BadgeLevel::Silver,
            }
        );
    }

    #[test]
    fn test_decode_withdrawal_log_keeps_hash() {
        let hash = TxHash::from_bytes([0xab; 32]);
        let topics = vec![
            topic::WITHDRAWAL.to_uppercase().replacen("0X", "0x", 1),
            topic_of(address_word(&investor())),
        ];
        let data = encode_words(&[uint_word(BaseUnits::from_whole(5).raw()), uint_word(99)]);

        match decode_log(&topics, &data, Some(hash.clone())).unwrap() {
            Some(ContractEvent::Withdrawal { amount, timestamp, tx_hash, .. }) => {
                assert_eq!(amount, BaseUnits::from_whole(5));
                assert_eq!(timestamp, 99);
                assert_eq!(tx_hash, Some(hash));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_negative_daily_change() {
        let change = -(BaseUnits::parse("6.5").unwrap().raw() as i128);
        let mut change_word = [0xffu8; 32];
        change_word[16..].copy_from_slice(&change.to_be_bytes());

        let topics = vec![topic::PERFORMANCE_UPDATE.to_string()];
        let data = encode_words(&[
            uint_word(1_000),
            uint_word(BaseUnits::from_whole(1_000_000).raw()),
            change_word,
            uint_word(42),
        ]);

        match decode_log(&topics, &data, None).unwrap() {
            Some(ContractEvent::PerformanceUpdate { daily_change, active_investors, .. }) => {
                assert!((daily_change + 6.5).abs() < 1e-9);
                assert_eq!(active_investors, 42);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_topic_ignored() {
        let topics = vec![topic_of(uint_word(1))];
        assert_eq!(decode_log(&topics, "0x", None).unwrap(), None);
        assert_eq!(decode_log(&[], "0x", None).unwrap(), None);
    }
}
