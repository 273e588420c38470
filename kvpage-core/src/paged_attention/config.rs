use candle_core::DType;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvCacheType {
    /// Same element type as the activations.
    #[default]
    Auto,
    /// Offset int8 data plus per (token, head) f32 scales.
    Int8,
}

impl KvCacheType {
    pub fn has_scale(&self) -> bool {
        matches!(self, Self::Int8)
    }
}

fn default_dtype() -> DType {
    DType::F32
}

mod dtype_serde {
    use candle_core::DType;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dtype: &DType, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(dtype.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DType, D::Error> {
        let s = String::deserialize(d)?;
        s.parse::<DType>().map_err(serde::de::Error::custom)
    }
}

/// Geometry of the paged KV cache pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    pub layer_num: usize,
    /// Physical blocks per layer, including the reserved null block.
    pub block_nums: usize,
    pub local_head_num_kv: usize,
    pub size_per_head: usize,
    pub seq_size_per_block: usize,
    #[serde(with = "dtype_serde", default = "default_dtype")]
    pub dtype: DType,
    #[serde(default)]
    pub kv_cache_type: KvCacheType,
    #[serde(default)]
    pub reuse_cache: bool,
}

impl CacheConfig {
    /// Bytes held by one block of one layer for keys and values together.
    pub fn block_bytes(&self) -> usize {
        let elems = self.seq_size_per_block * self.local_head_num_kv * self.size_per_head;
        match self.kv_cache_type {
            KvCacheType::Auto => 2 * elems * self.dtype.size_in_bytes(),
            KvCacheType::Int8 => {
                2 * (elems + self.seq_size_per_block * self.local_head_num_kv * 4)
            }
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.block_bytes() * self.block_nums * self.layer_num
    }
}
