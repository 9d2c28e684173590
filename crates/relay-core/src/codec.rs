use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{RelayError, codes};

/// 调用方提供的结果编解码对：把类型化结果转换为不透明字节，反之亦然。
///
/// # 设计背景（Why）
/// - 缓存与幂等存储只保存字节，不做任何反射式编解码；类型知识完全由调用方
///   以一对闭包注入，协调器对结果类型保持不可知。
///
/// # 契约说明（What）
/// - `encode`/`decode` 必须互逆：`decode(encode(v))` 在语义上等于 `v`；
/// - `decode` 失败以 [`codes::CACHE_DECODE`] 表达，协调器将其视为软性未命中；
/// - 闭包需满足 `Send + Sync`，会被多任务并发调用。
pub struct ResultCodec<R> {
    encode: Arc<dyn Fn(&R) -> Result<Vec<u8>, RelayError> + Send + Sync>,
    decode: Arc<dyn Fn(&[u8]) -> Result<R, RelayError> + Send + Sync>,
}

impl<R> Clone for ResultCodec<R> {
    fn clone(&self) -> Self {
        Self {
            encode: Arc::clone(&self.encode),
            decode: Arc::clone(&self.decode),
        }
    }
}

impl<R> ResultCodec<R> {
    /// 以一对闭包构造编解码器。
    pub fn new(
        encode: impl Fn(&R) -> Result<Vec<u8>, RelayError> + Send + Sync + 'static,
        decode: impl Fn(&[u8]) -> Result<R, RelayError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }

    /// 编码结果为字节。
    pub fn encode(&self, value: &R) -> Result<Vec<u8>, RelayError> {
        (self.encode)(value)
    }

    /// 从字节解码结果。
    pub fn decode(&self, bytes: &[u8]) -> Result<R, RelayError> {
        (self.decode)(bytes)
    }
}

impl<R> ResultCodec<R>
where
    R: Serialize + DeserializeOwned + 'static,
{
    /// 基于 JSON 的便捷编解码器。
    pub fn json() -> Self {
        Self::new(
            |value| {
                serde_json::to_vec(value).map_err(|err| {
                    RelayError::new(codes::EXECUTION_FAILED, "结果 JSON 编码失败").with_cause(err)
                })
            },
            |bytes| {
                serde_json::from_slice(bytes).map_err(|err| {
                    RelayError::new(codes::CACHE_DECODE, "结果 JSON 解码失败").with_cause(err)
                })
            },
        )
    }
}

impl<R> std::fmt::Debug for ResultCodec<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCodec").finish_non_exhaustive()
    }
}
