//! Raw node payloads into canonical [`Block`]/[`Transaction`] records.
//!
//! Accepts Bitcoin Core `getblock` output at verbosity 2 or 3 (the latter
//! carries `prevout` on every input, which is what makes input values and
//! input addresses available). All amounts become integer satoshis here.

use bitcoin::{Address, Amount, Network, ScriptBuf};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use super::{Block, RawBlock, ScriptInfo, Transaction, TxInput, TxOutput};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed block payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("missing or invalid field `{0}`")]
    Field(&'static str),
    #[error("invalid amount {value} in tx {txid}")]
    Amount { txid: String, value: f64 },
    #[error("value total overflows in {0}")]
    Overflow(String),
}

/// Sum of satoshi values, failing instead of wrapping.
fn checked_total<I>(values: I, owner: &str) -> Result<u64, ValidationError>
where
    I: IntoIterator<Item = u64>,
{
    values
        .into_iter()
        .try_fold(0u64, |acc, v| acc.checked_add(v))
        .ok_or_else(|| ValidationError::Overflow(owner.to_string()))
}

#[derive(Debug, Deserialize)]
struct NodeBlock {
    hash: String,
    height: u64,
    time: i64,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    weight: u64,
    #[serde(rename = "nTx", default)]
    n_tx: Option<usize>,
    #[serde(rename = "previousblockhash", default)]
    prev_hash: Option<String>,
    #[serde(default)]
    tx: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct NodeTx {
    txid: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    vsize: u64,
    #[serde(default)]
    weight: u64,
    #[serde(default)]
    fee: Option<f64>,
    #[serde(default)]
    vin: Vec<NodeVin>,
    #[serde(default)]
    vout: Vec<NodeVout>,
}

#[derive(Debug, Deserialize)]
struct NodeVin {
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    vout: Option<u32>,
    #[serde(default)]
    coinbase: Option<String>,
    #[serde(default)]
    prevout: Option<NodePrevout>,
}

#[derive(Debug, Deserialize)]
struct NodePrevout {
    value: f64,
    #[serde(rename = "scriptPubKey", default)]
    script_pubkey: Option<NodeScriptPubKey>,
}

#[derive(Debug, Deserialize)]
struct NodeVout {
    value: f64,
    #[serde(default)]
    n: Option<usize>,
    #[serde(rename = "scriptPubKey", default)]
    script_pubkey: Option<NodeScriptPubKey>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeScriptPubKey {
    #[serde(default)]
    hex: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    addresses: Option<Vec<String>>,
    #[serde(rename = "type", default)]
    script_type: Option<String>,
}

/// Converts node payloads for one network.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    network: Network,
}

impl Normalizer {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    pub fn normalize_block(&self, raw: &RawBlock) -> Result<Block, ValidationError> {
        if !raw.payload.is_object() {
            return Err(ValidationError::Field("block"));
        }
        let node: NodeBlock = serde_json::from_value(raw.payload.clone())?;
        if node.hash.is_empty() {
            return Err(ValidationError::Field("hash"));
        }
        let timestamp =
            DateTime::<Utc>::from_timestamp(node.time, 0).ok_or(ValidationError::Field("time"))?;

        let mut transactions = Vec::with_capacity(node.tx.len());
        if !raw.limited_detail {
            for (position, value) in node.tx.into_iter().enumerate() {
                // verbosity 1 lists bare txids: no detail to normalize
                if value.is_string() {
                    continue;
                }
                let tx: NodeTx = serde_json::from_value(value)?;
                transactions.push(self.normalize_tx(tx, node.height, position)?);
            }
        }

        let fees_total = checked_total(transactions.iter().map(|tx| tx.fee), &node.hash)?;
        let tx_count = node.n_tx.unwrap_or(transactions.len());
        Ok(Block {
            hash: node.hash,
            height: node.height,
            prev_hash: node.prev_hash,
            timestamp,
            size: node.size,
            weight: node.weight,
            tx_count,
            fees_total,
            transactions,
            limited_detail: raw.limited_detail,
        })
    }

    fn normalize_tx(
        &self,
        tx: NodeTx,
        block_height: u64,
        position: usize,
    ) -> Result<Transaction, ValidationError> {
        let is_coinbase = tx
            .vin
            .first()
            .map(|vin| vin.txid.is_none())
            .unwrap_or(false);

        let mut inputs = Vec::with_capacity(tx.vin.len());
        let mut prevouts_known = true;
        for (index, vin) in tx.vin.into_iter().enumerate() {
            let (value, addresses, script) = match vin.prevout {
                Some(prevout) => {
                    let value = to_sats(&tx.txid, prevout.value)?;
                    let spk = prevout.script_pubkey.unwrap_or_default();
                    (value, self.addresses(&spk), script_info(&spk))
                }
                None => {
                    if vin.txid.is_some() {
                        prevouts_known = false;
                    }
                    (0, Vec::new(), ScriptInfo::default())
                }
            };
            inputs.push(TxInput {
                index,
                prev_txid: vin.txid,
                prev_vout: vin.vout,
                value,
                addresses,
                script,
                coinbase_data: vin.coinbase,
            });
        }

        let mut outputs = Vec::with_capacity(tx.vout.len());
        for (index, vout) in tx.vout.into_iter().enumerate() {
            let spk = vout.script_pubkey.unwrap_or_default();
            outputs.push(TxOutput {
                index: vout.n.unwrap_or(index),
                value: to_sats(&tx.txid, vout.value)?,
                addresses: self.addresses(&spk),
                script: script_info(&spk),
            });
        }

        let output_value = checked_total(outputs.iter().map(|o| o.value), &tx.txid)?;
        let (input_value, fee) = if is_coinbase {
            (0, 0)
        } else {
            let reported_input: u64 = if prevouts_known {
                checked_total(inputs.iter().map(|i| i.value), &tx.txid)?
            } else {
                match tx.fee {
                    Some(fee) => checked_total([output_value, to_sats(&tx.txid, fee)?], &tx.txid)?,
                    None => output_value,
                }
            };
            settle_fee(reported_input, output_value)
        };

        let vsize = if tx.vsize > 0 {
            tx.vsize
        } else {
            tx.weight.div_ceil(4)
        };

        Ok(Transaction {
            txid: tx.txid,
            block_height,
            position,
            input_count: inputs.len(),
            output_count: outputs.len(),
            input_value,
            output_value,
            fee,
            size: tx.size,
            vsize,
            weight: tx.weight,
            is_coinbase,
            inputs,
            outputs,
        })
    }

    fn addresses(&self, spk: &NodeScriptPubKey) -> Vec<String> {
        if let Some(address) = &spk.address {
            return vec![address.clone()];
        }
        if let Some(addresses) = &spk.addresses {
            return addresses.clone();
        }
        spk.hex
            .as_deref()
            .and_then(|hex| ScriptBuf::from_hex(hex).ok())
            .and_then(|script| Address::from_script(&script, self.network).ok())
            .map(|address| vec![address.to_string()])
            .unwrap_or_default()
    }
}

/// Returns `(input_value, fee)`. A negative difference is a data-quality
/// problem: fee is floored at zero and input value raised to match.
pub fn settle_fee(input_value: u64, output_value: u64) -> (u64, u64) {
    if input_value >= output_value {
        (input_value, input_value - output_value)
    } else {
        (output_value, 0)
    }
}

fn to_sats(txid: &str, btc: f64) -> Result<u64, ValidationError> {
    Amount::from_btc(btc)
        .map(|amount| amount.to_sat())
        .map_err(|_| ValidationError::Amount {
            txid: txid.to_string(),
            value: btc,
        })
}

fn script_info(spk: &NodeScriptPubKey) -> ScriptInfo {
    ScriptInfo {
        script_type: spk.script_type.clone(),
        hex: spk.hex.clone(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn raw(payload: serde_json::Value) -> RawBlock {
        RawBlock {
            payload,
            limited_detail: false,
            source: "test".into(),
        }
    }

    pub(crate) fn sample_block_json() -> serde_json::Value {
        json!({
            "hash": "000000000000000000023a",
            "height": 850000,
            "time": 1718000000,
            "size": 1500000,
            "weight": 3990000,
            "nTx": 3,
            "previousblockhash": "000000000000000000019f",
            "tx": [
                {
                    "txid": "cb01",
                    "size": 200, "vsize": 170, "weight": 680,
                    "vin": [{"coinbase": "03d0f90c2f466f756e6472792055534120506f6f6c2f", "sequence": 4294967295u64}],
                    "vout": [
                        {"value": 3.2, "n": 0, "scriptPubKey": {"address": "bc1qpool", "type": "witness_v0_keyhash"}}
                    ]
                },
                {
                    "txid": "aa01",
                    "size": 250, "vsize": 200, "weight": 800,
                    "vin": [
                        {"txid": "prev1", "vout": 0, "prevout": {"value": 1.5, "scriptPubKey": {"address": "bc1qsender"}}}
                    ],
                    "vout": [
                        {"value": 1.0, "n": 0, "scriptPubKey": {"address": "bc1qexchange"}},
                        {"value": 0.4999, "n": 1, "scriptPubKey": {"address": "bc1qchange"}}
                    ]
                },
                {
                    "txid": "aa02",
                    "size": 250, "vsize": 200, "weight": 800,
                    "vin": [
                        {"txid": "prev2", "vout": 3, "prevout": {"value": 0.5, "scriptPubKey": {"address": "bc1qother"}}}
                    ],
                    "vout": [
                        {"value": 0.6, "n": 0, "scriptPubKey": {"address": "bc1qdest"}}
                    ]
                }
            ]
        })
    }

    #[test]
    fn normalizes_block_and_fees() {
        let block = Normalizer::new(Network::Bitcoin)
            .normalize_block(&raw(sample_block_json()))
            .unwrap();
        assert_eq!(block.height, 850_000);
        assert_eq!(block.tx_count, 3);
        assert_eq!(block.transactions.len(), 3);
        assert_eq!(block.prev_hash.as_deref(), Some("000000000000000000019f"));

        let coinbase = &block.transactions[0];
        assert!(coinbase.is_coinbase);
        assert_eq!(coinbase.fee, 0);
        assert!(coinbase.inputs[0].coinbase_data.is_some());

        let spend = &block.transactions[1];
        assert!(!spend.is_coinbase);
        assert_eq!(spend.input_value, 150_000_000);
        assert_eq!(spend.output_value, 149_990_000);
        assert_eq!(spend.fee, 10_000);
        assert_eq!(spend.outputs[0].addresses, vec!["bc1qexchange".to_string()]);

        // outputs exceed inputs: fee floored, input raised
        let odd = &block.transactions[2];
        assert_eq!(odd.fee, 0);
        assert_eq!(odd.input_value, odd.output_value);

        assert_eq!(block.fees_total, 10_000);
    }

    #[test]
    fn coinbase_implies_zero_fee_and_others_match_formula() {
        let block = Normalizer::new(Network::Bitcoin)
            .normalize_block(&raw(sample_block_json()))
            .unwrap();
        for tx in &block.transactions {
            if tx.is_coinbase {
                assert_eq!(tx.fee, 0);
            } else {
                let inputs: u64 = tx.inputs.iter().map(|i| i.value).sum();
                assert_eq!(tx.fee, inputs.saturating_sub(tx.output_value));
            }
        }
    }

    #[test]
    fn reported_fee_used_without_prevouts() {
        let payload = json!({
            "hash": "h", "height": 1, "time": 1718000000,
            "tx": [{
                "txid": "t", "vsize": 100, "fee": 0.0001,
                "vin": [{"txid": "p", "vout": 0}],
                "vout": [{"value": 1.0, "n": 0, "scriptPubKey": {"address": "a"}}]
            }]
        });
        let block = Normalizer::new(Network::Bitcoin).normalize_block(&raw(payload)).unwrap();
        let tx = &block.transactions[0];
        assert_eq!(tx.fee, 10_000);
        assert_eq!(tx.input_value, 100_010_000);
    }

    #[test]
    fn derives_address_from_script_hex() {
        // P2PKH of the genesis coinbase key hash
        let payload = json!({
            "hash": "h", "height": 1, "time": 1718000000,
            "tx": [{
                "txid": "t",
                "vin": [{"coinbase": "00"}],
                "vout": [{"value": 50.0, "n": 0, "scriptPubKey": {
                    "hex": "76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac",
                    "type": "pubkeyhash"
                }}]
            }]
        });
        let block = Normalizer::new(Network::Bitcoin).normalize_block(&raw(payload)).unwrap();
        assert_eq!(
            block.transactions[0].outputs[0].addresses,
            vec!["1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".to_string()]
        );
    }

    #[test]
    fn missing_hash_is_validation_error() {
        let payload = json!({"height": 1, "time": 1718000000});
        let err = Normalizer::new(Network::Bitcoin).normalize_block(&raw(payload));
        assert!(matches!(err, Err(ValidationError::Malformed(_))));
    }

    #[test]
    fn negative_amount_is_rejected() {
        let payload = json!({
            "hash": "h", "height": 1, "time": 1718000000,
            "tx": [{"txid": "t", "vin": [{"coinbase": "00"}], "vout": [{"value": -1.0}]}]
        });
        let err = Normalizer::new(Network::Bitcoin).normalize_block(&raw(payload));
        assert!(matches!(err, Err(ValidationError::Amount { .. })));
    }

    #[test]
    fn overflowing_output_total_is_rejected() {
        // each output fits in a u64 of satoshis, their sum does not
        let payload = json!({
            "hash": "h", "height": 1, "time": 1718000000,
            "tx": [{"txid": "big", "vin": [{"coinbase": "00"}], "vout": [
                {"value": 100_000_000_000.0, "n": 0, "scriptPubKey": {"address": "a"}},
                {"value": 100_000_000_000.0, "n": 1, "scriptPubKey": {"address": "b"}}
            ]}]
        });
        let err = Normalizer::new(Network::Bitcoin).normalize_block(&raw(payload));
        match err {
            Err(ValidationError::Overflow(owner)) => assert_eq!(owner, "big"),
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn limited_detail_skips_transactions() {
        let mut raw_block = raw(sample_block_json());
        raw_block.limited_detail = true;
        let block = Normalizer::new(Network::Bitcoin).normalize_block(&raw_block).unwrap();
        assert!(block.transactions.is_empty());
        assert_eq!(block.tx_count, 3);
        assert_eq!(block.fees_total, 0);
        assert!(block.limited_detail);
    }

    #[test]
    fn settle_fee_guard() {
        assert_eq!(settle_fee(100, 90), (100, 10));
        assert_eq!(settle_fee(90, 100), (100, 0));
    }
}
