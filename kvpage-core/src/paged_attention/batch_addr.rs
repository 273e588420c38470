use std::fmt::Write;

use candle_core::{Device, Result, Tensor};

use super::block_table::{write_layers, BlockTable};

/// Id written into padding positions of flattened pointer arrays.
pub const NULL_BLOCK_ID: i64 = 0;

/// Block tables of every active sequence in a step, generate slots first.
#[derive(Clone, Debug, Default)]
pub struct BatchBlockAddressing {
    tables: Vec<BlockTable>,
}

impl BatchBlockAddressing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sequence(&mut self, table: BlockTable) {
        if let Some(first) = self.tables.first() {
            if !table.is_empty() && !first.is_empty() {
                assert_eq!(
                    first.has_scale(),
                    table.has_scale(),
                    "scale blocks must be present for every sequence or for none"
                );
            }
        }
        self.tables.push(table);
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, slot: usize) -> &BlockTable {
        &self.tables[slot]
    }

    pub fn tables(&self) -> &[BlockTable] {
        &self.tables
    }

    pub(crate) fn table_mut(&mut self, slot: usize) -> &mut BlockTable {
        &mut self.tables[slot]
    }

    pub fn resize(&mut self, batch_slot: usize, layer: usize, block_count: usize) {
        self.tables[batch_slot].resize(layer, block_count);
    }

    pub fn append(&mut self, batch_slot: usize, addr: &BlockTable) {
        assert!(
            batch_slot < self.tables.len(),
            "append to batch slot {batch_slot} of a batch of {}",
            self.tables.len()
        );
        self.tables[batch_slot].append(addr);
    }

    fn has_scale(&self) -> bool {
        self.tables.iter().any(|t| t.has_scale() && !t.is_empty())
    }

    pub fn debug_string(&self) -> String {
        let mut k = String::new();
        let mut v = String::new();
        let mut k_scale = String::new();
        let mut v_scale = String::new();
        let with_scale = self.has_scale();
        for (i, table) in self.tables.iter().enumerate() {
            let layers = table.layers();
            let _ = write!(k, "batch: {i} ");
            let _ = write!(v, "batch: {i} ");
            write_layers(&mut k, layers, |l| &l.k);
            write_layers(&mut v, layers, |l| &l.v);
            if with_scale {
                let _ = write!(k_scale, "batch: {i} ");
                let _ = write!(v_scale, "batch: {i} ");
                write_layers(&mut k_scale, layers, |l| &l.k_scale);
                write_layers(&mut v_scale, layers, |l| &l.v_scale);
            }
        }
        format!(
            "BatchKVCacheBlockAddr {{k_ptr: {k}v_ptr: {v}k_scale_ptr: {k_scale}v_scale_ptr: {v_scale}}}"
        )
    }

    /// Flatten into `[batch, 2, layer_num, max_blocks]` with null-block padding.
    pub fn flatten(&self, device: &Device) -> Result<FlatBlockPointers> {
        let batch = self.tables.len();
        let layer_num = self
            .tables
            .iter()
            .map(BlockTable::layer_num)
            .max()
            .unwrap_or(0);
        let max_blocks = self
            .tables
            .iter()
            .flat_map(|t| (0..t.layer_num()).map(move |l| t.k_blocks(l).len()))
            .max()
            .unwrap_or(0);

        let fill = |get: fn(&BlockTable, usize) -> (&[usize], &[usize])| {
            let mut host = vec![NULL_BLOCK_ID; batch * 2 * layer_num * max_blocks];
            for (b, table) in self.tables.iter().enumerate() {
                for l in 0..table.layer_num() {
                    let (k, v) = get(table, l);
                    for (kv, ids) in [k, v].into_iter().enumerate() {
                        let base = ((b * 2 + kv) * layer_num + l) * max_blocks;
                        for (i, &id) in ids.iter().enumerate() {
                            host[base + i] = id as i64;
                        }
                    }
                }
            }
            host
        };

        let host_block_pointers = fill(|t, l| (t.k_blocks(l), t.v_blocks(l)));
        let block_pointers = Tensor::from_slice(
            &host_block_pointers,
            (batch, 2, layer_num, max_blocks),
            device,
        )?;
        let (block_scale_pointers, host_block_scale_pointers) = if self.has_scale() {
            let host = fill(|t, l| (t.k_scale_blocks(l), t.v_scale_blocks(l)));
            let dev = Tensor::from_slice(&host, (batch, 2, layer_num, max_blocks), device)?;
            (Some(dev), Some(host))
        } else {
            (None, None)
        };

        Ok(FlatBlockPointers {
            batch,
            layer_num,
            max_blocks,
            block_pointers,
            host_block_pointers,
            block_scale_pointers,
            host_block_scale_pointers,
        })
    }
}

/// Dense block-pointer arrays handed to the attention kernels.
#[derive(Clone, Debug)]
pub struct FlatBlockPointers {
    batch: usize,
    layer_num: usize,
    max_blocks: usize,
    /// `I64`, shape `[batch, 2, layer_num, max_blocks]`.
    pub block_pointers: Tensor,
    pub host_block_pointers: Vec<i64>,
    pub block_scale_pointers: Option<Tensor>,
    pub host_block_scale_pointers: Option<Vec<i64>>,
}

impl FlatBlockPointers {
    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn layer_num(&self) -> usize {
        self.layer_num
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    fn offset(&self, slot: usize, kv: usize, layer: usize) -> usize {
        assert!(slot < self.batch && kv < 2 && layer < self.layer_num);
        ((slot * 2 + kv) * self.layer_num + layer) * self.max_blocks
    }

    /// The first `n` block ids of one row. `kv` is 0 for keys and 1 for values.
    pub fn blocks(&self, slot: usize, kv: usize, layer: usize, n: usize) -> &[i64] {
        let start = self.offset(slot, kv, layer);
        &self.host_block_pointers[start..start + n.min(self.max_blocks)]
    }

    pub fn scale_blocks(&self, slot: usize, kv: usize, layer: usize, n: usize) -> Option<&[i64]> {
        let start = self.offset(slot, kv, layer);
        self.host_block_scale_pointers
            .as_ref()
            .map(|h| &h[start..start + n.min(self.max_blocks)])
    }

    /// Sub-batch `start..start + len`, used to split generate and context slots.
    pub fn narrow_batch(&self, start: usize, len: usize) -> Result<Self> {
        if start + len > self.batch {
            candle_core::bail!(
                "narrow_batch {start}..{} out of a batch of {}",
                start + len,
                self.batch
            );
        }
        let row = 2 * self.layer_num * self.max_blocks;
        let host = |h: &Vec<i64>| h[start * row..(start + len) * row].to_vec();
        Ok(Self {
            batch: len,
            layer_num: self.layer_num,
            max_blocks: self.max_blocks,
            block_pointers: self.block_pointers.narrow(0, start, len)?,
            host_block_pointers: host(&self.host_block_pointers),
            block_scale_pointers: self
                .block_scale_pointers
                .as_ref()
                .map(|t| t.narrow(0, start, len))
                .transpose()?,
            host_block_scale_pointers: self.host_block_scale_pointers.as_ref().map(host),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paged_attention::BlockHandles;

    fn batch() -> BatchBlockAddressing {
        let mut b = BatchBlockAddressing::new();
        b.add_sequence(BlockTable::uniform(2, &[1, 2, 3], false));
        b.add_sequence(BlockTable::uniform(2, &[4], false));
        b
    }

    #[test]
    fn test_flatten_pads_with_null_block() -> Result<()> {
        let flat = batch().flatten(&Device::Cpu)?;
        assert_eq!(flat.block_pointers.dims(), &[2, 2, 2, 3]);
        assert_eq!(flat.blocks(0, 1, 1, 3), &[1, 2, 3]);
        assert_eq!(flat.blocks(1, 0, 0, 3), &[4, 0, 0]);
        assert!(flat.block_scale_pointers.is_none());
        let dev = flat.block_pointers.flatten_all()?.to_vec1::<i64>()?;
        assert_eq!(dev, flat.host_block_pointers);
        Ok(())
    }

    #[test]
    fn test_flatten_is_idempotent() -> Result<()> {
        let b = batch();
        let a = b.flatten(&Device::Cpu)?;
        let c = b.flatten(&Device::Cpu)?;
        assert_eq!(a.host_block_pointers, c.host_block_pointers);
        Ok(())
    }

    #[test]
    fn test_flatten_scale() -> Result<()> {
        let mut b = BatchBlockAddressing::new();
        b.add_sequence(BlockTable::uniform(1, &[3, 5], true));
        let flat = b.flatten(&Device::Cpu)?;
        assert_eq!(flat.scale_blocks(0, 0, 0, 2), Some(&[3i64, 5][..]));
        assert_eq!(
            flat.block_scale_pointers.as_ref().map(|t| t.dims().to_vec()),
            Some(vec![1, 2, 1, 2])
        );
        Ok(())
    }

    #[test]
    fn test_append_and_resize() {
        let mut b = batch();
        b.append(1, &BlockTable::uniform(2, &[8, 9], false));
        assert_eq!(b.table(1).k_blocks(0), &[4, 8, 9]);
        b.resize(1, 0, 1);
        assert_eq!(b.table(1).k_blocks(0), &[4]);
        assert_eq!(b.table(1).k_blocks(1), &[4, 8, 9]);
    }

    #[test]
    #[should_panic]
    fn test_append_out_of_range_panics() {
        let mut b = batch();
        b.append(2, &BlockTable::uniform(2, &[8], false));
    }

    #[test]
    fn test_narrow_batch() -> Result<()> {
        let flat = batch().flatten(&Device::Cpu)?;
        let ctx = flat.narrow_batch(1, 1)?;
        assert_eq!(ctx.batch(), 1);
        assert_eq!(ctx.blocks(0, 0, 1, 1), &[4]);
        assert_eq!(ctx.block_pointers.dims(), &[1, 2, 2, 3]);
        assert!(flat.narrow_batch(1, 2).is_err());
        Ok(())
    }

    #[test]
    fn test_debug_string() {
        let mut b = BatchBlockAddressing::new();
        let mut t = BlockTable::default();
        t.push_back(&[BlockHandles::same(1, false)]);
        b.add_sequence(t);
        assert_eq!(
            b.debug_string(),
            "BatchKVCacheBlockAddr {k_ptr: batch: 0 layer:0;1, v_ptr: batch: 0 layer:0;1, k_scale_ptr: v_scale_ptr: }"
        );
    }
}
