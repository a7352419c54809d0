//! JSON-RPC chain client: HTTP for requests, WebSocket for the newHeads subscription.

use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::Log;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::chain::{BlockHeader, BlockTag, ChainClient, HeadSubscription, LogFilter, LogProvider};
use crate::config::ReaderConfig;
use crate::error::{ReaderError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const HEADER_CHANNEL_CAPACITY: usize = 64;

/// Chain client speaking Ethereum JSON-RPC.
pub struct JsonRpcClient {
    http: reqwest::Client,
    http_url: String,
    ws_url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(http_url: impl Into<String>, ws_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            http_url: http_url.into(),
            ws_url: ws_url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &ReaderConfig) -> Result<Self> {
        Self::new(config.http_url.clone(), config.ws_url.clone())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params
        });
        let resp = self.http.post(&self.http_url).json(&body).send().await?;
        let json: Value = resp.json().await?;
        if let Some(err) = json.get("error") {
            return Err(ReaderError::Rpc(format!("{method}: {err}")));
        }
        json.get("result")
            .cloned()
            .ok_or_else(|| ReaderError::Decode(format!("{method}: missing result")))
    }
}

fn parse_hex_u64(s: &str) -> Result<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| ReaderError::Decode(format!("parse hex u64: {e}")))
}

fn field_str<'a>(v: &'a Value, key: &str) -> Result<&'a str> {
    v.get(key)
        .and_then(|f| f.as_str())
        .ok_or_else(|| ReaderError::Decode(format!("missing {key}")))
}

fn parse_b256(s: &str) -> Result<B256> {
    s.parse::<B256>()
        .map_err(|e| ReaderError::Decode(format!("parse hash: {e}")))
}

/// Decode a JSON-RPC block or newHeads payload into a [BlockHeader].
pub fn parse_header(v: &Value) -> Result<BlockHeader> {
    Ok(BlockHeader {
        number: parse_hex_u64(field_str(v, "number")?)?,
        hash: match v.get("hash") {
            None | Some(Value::Null) => None,
            Some(_) => Some(parse_b256(field_str(v, "hash")?)?),
        },
        parent_hash: parse_b256(field_str(v, "parentHash")?)?,
    })
}

#[async_trait]
impl ChainClient for JsonRpcClient {
    async fn chain_id(&self) -> Result<u64> {
        let result = self.request("eth_chainId", json!([])).await?;
        let s = result
            .as_str()
            .ok_or_else(|| ReaderError::Decode("chainId not string".into()))?;
        parse_hex_u64(s)
    }

    async fn header_by_number(&self, tag: BlockTag) -> Result<BlockHeader> {
        let result = self
            .request("eth_getBlockByNumber", json!([tag.to_rpc(), false]))
            .await?;
        if result.is_null() {
            return Err(ReaderError::Rpc(format!("block {:?} not found", tag)));
        }
        parse_header(&result)
    }

    async fn subscribe_new_heads(&self) -> Result<HeadSubscription> {
        let (ws_stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| ReaderError::WebSocket(format!("connect: {e}")))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let sub_req = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": "eth_subscribe",
            "params": ["newHeads"]
        });
        ws_sender
            .send(Message::Text(serde_json::to_string(&sub_req)?))
            .await
            .map_err(|e| ReaderError::WebSocket(format!("send subscribe: {e}")))?;

        let sub_id = match timeout(SUBSCRIBE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let v: Value = serde_json::from_str(&text)?;
                if let Some(err) = v.get("error") {
                    return Err(ReaderError::Subscription(err.to_string()));
                }
                v["result"]
                    .as_str()
                    .ok_or_else(|| ReaderError::Subscription("no subscription id".into()))?
                    .to_string()
            }
            Ok(Some(Ok(_))) => return Err(ReaderError::Subscription("unexpected message".into())),
            Ok(Some(Err(e))) => return Err(ReaderError::WebSocket(e.to_string())),
            Ok(None) => return Err(ReaderError::WebSocket("closed during subscribe".into())),
            Err(_) => return Err(ReaderError::Subscription("subscribe timeout".into())),
        };
        tracing::debug!(subscription = %sub_id, "subscribed to newHeads");

        let (header_tx, header_rx) = mpsc::channel(HEADER_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            // Keep the sink alive for the lifetime of the subscription.
            let _ws_sender = ws_sender;
            let failure = loop {
                let msg = match ws_receiver.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => break ReaderError::WebSocket(e.to_string()),
                    None => break ReaderError::WebSocket("connection closed".into()),
                };
                let text = match msg {
                    Message::Text(t) => t,
                    Message::Close(_) => break ReaderError::WebSocket("server closed".into()),
                    _ => continue,
                };
                let v: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => break ReaderError::Decode(e.to_string()),
                };
                if v.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
                    continue;
                }
                let header = match v.get("params").and_then(|p| p.get("result")) {
                    Some(result) => match parse_header(result) {
                        Ok(h) => h,
                        Err(e) => break e,
                    },
                    None => break ReaderError::Decode("no params.result".into()),
                };
                if header_tx.send(header).await.is_err() {
                    return;
                }
            };
            let _ = err_tx.send(failure);
        });
        Ok(HeadSubscription::new(header_rx, err_rx, Some(task)))
    }
}

#[async_trait]
impl LogProvider for JsonRpcClient {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        let result = self.request("eth_getLogs", json!([filter.to_json()])).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn call(&self, to: Address, data: Bytes, block: BlockTag) -> Result<Bytes> {
        let params = json!([{
            "to": to,
            "data": format!("0x{}", hex::encode(&data)),
        }, block.to_rpc()]);
        let result = self.request("eth_call", params).await?;
        let s = result
            .as_str()
            .ok_or_else(|| ReaderError::Decode("eth_call result not string".into()))?;
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))
            .map_err(|e| ReaderError::Decode(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_new_heads_payload() {
        let v = json!({
            "number": "0x1b4",
            "hash": format!("0x{}", "ab".repeat(32)),
            "parentHash": format!("0x{}", "cd".repeat(32)),
            "timestamp": "0x55ba467c"
        });
        let h = parse_header(&v).unwrap();
        assert_eq!(h.number, 436);
        assert_eq!(h.hash, Some(B256::repeat_byte(0xab)));
        assert_eq!(h.parent_hash, B256::repeat_byte(0xcd));
    }

    #[test]
    fn pending_block_without_hash_parses() {
        let v = json!({
            "number": "0x1b5",
            "hash": null,
            "parentHash": format!("0x{}", "cd".repeat(32)),
        });
        let h = parse_header(&v).unwrap();
        assert_eq!(h.number, 437);
        assert_eq!(h.hash, None);
        assert_eq!(h.parent_hash, B256::repeat_byte(0xcd));
    }

    #[test]
    fn header_without_number_is_rejected() {
        let v = json!({ "hash": "0x00" });
        assert!(matches!(parse_header(&v), Err(ReaderError::Decode(_))));
    }

    #[test]
    fn parse_hex_accepts_prefix() {
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
        assert_eq!(parse_hex_u64("ff").unwrap(), 255);
        assert!(parse_hex_u64("0xzz").is_err());
    }
}
