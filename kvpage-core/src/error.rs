use candle_core::DType;

#[derive(thiserror::Error, Debug)]
pub enum AttentionError {
    #[error("attention does not support dtype {0:?}, expected f32, f16 or bf16")]
    UnsupportedDType(DType),
    #[error("scratch buffer `{0}` was not allocated for this forward")]
    MissingBuffer(&'static str),
    #[error("{backend} requires head_num == head_num_kv, got {head_num} and {head_num_kv}")]
    HeadMismatch {
        backend: &'static str,
        head_num: usize,
        head_num_kv: usize,
    },
    #[error("{backend} cannot run on device {device}")]
    UnsupportedDevice {
        backend: &'static str,
        device: String,
    },
    #[error("tp_size is {0} but no all-reduce was provided")]
    MissingAllReduce(usize),
    #[error("invalid attention config: {0}")]
    InvalidConfig(String),
    #[error("{0} requires a kv cache")]
    NoKvCache(&'static str),
    #[error("missing attention input `{0}`")]
    MissingInput(&'static str),
}

impl From<AttentionError> for candle_core::Error {
    fn from(e: AttentionError) -> Self {
        candle_core::Error::wrap(e)
    }
}
