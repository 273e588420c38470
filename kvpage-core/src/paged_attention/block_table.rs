use std::fmt::Write;

/// Block ids of one layer of one sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerBlocks {
    pub k: Vec<usize>,
    pub v: Vec<usize>,
    pub k_scale: Vec<usize>,
    pub v_scale: Vec<usize>,
}

impl LayerBlocks {
    fn truncate(&mut self, block_count: usize) {
        assert!(
            block_count <= self.k.len(),
            "resize can only shrink a block table: {} blocks requested, {} held",
            block_count,
            self.k.len()
        );
        self.k.truncate(block_count);
        self.v.truncate(block_count);
        self.k_scale.truncate(block_count);
        self.v_scale.truncate(block_count);
    }
}

/// The handles added to one layer by [`BlockTable::push_back`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHandles {
    pub k: usize,
    pub v: usize,
    /// `(k_scale, v_scale)` when the cache stores int8 with scales.
    pub scale: Option<(usize, usize)>,
}

impl BlockHandles {
    /// The same block id for keys, values and (optionally) their scales, which is
    /// how a single pool index addresses every per-layer tensor.
    pub fn same(block: usize, with_scale: bool) -> Self {
        Self {
            k: block,
            v: block,
            scale: with_scale.then_some((block, block)),
        }
    }
}

/// Per-sequence mapping from (layer, logical block index) to physical block ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockTable {
    layers: Vec<LayerBlocks>,
    has_scale: bool,
}

impl BlockTable {
    pub fn new(layer_num: usize, has_scale: bool) -> Self {
        Self {
            layers: vec![LayerBlocks::default(); layer_num],
            has_scale,
        }
    }

    /// Table holding the same block list at every layer.
    pub fn uniform(layer_num: usize, blocks: &[usize], has_scale: bool) -> Self {
        let layer = LayerBlocks {
            k: blocks.to_vec(),
            v: blocks.to_vec(),
            k_scale: if has_scale { blocks.to_vec() } else { vec![] },
            v_scale: if has_scale { blocks.to_vec() } else { vec![] },
        };
        Self {
            layers: vec![layer; layer_num],
            has_scale,
        }
    }

    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.k.clear();
            layer.v.clear();
            layer.k_scale.clear();
            layer.v_scale.clear();
        }
    }

    /// Append one block at every layer; `addr[l]` goes to layer `l`.
    pub fn push_back(&mut self, addr: &[BlockHandles]) {
        let addr_scale = addr.first().is_some_and(|h| h.scale.is_some());
        assert!(
            addr.iter().all(|h| h.scale.is_some() == addr_scale),
            "scale handles must be given for every layer or for none"
        );
        if self.is_empty() {
            self.layers = vec![LayerBlocks::default(); addr.len()];
            self.has_scale = addr_scale;
        }
        assert_eq!(
            addr.len(),
            self.layers.len(),
            "push_back with {} layers into a table of {} layers",
            addr.len(),
            self.layers.len()
        );
        assert_eq!(
            addr_scale, self.has_scale,
            "scale handles do not match the table"
        );
        for (layer, h) in self.layers.iter_mut().zip(addr) {
            layer.k.push(h.k);
            layer.v.push(h.v);
            if let Some((ks, vs)) = h.scale {
                layer.k_scale.push(ks);
                layer.v_scale.push(vs);
            }
        }
    }

    /// Truncate layer `layer` to `block_count` blocks. Growing is an invariant violation.
    pub fn resize(&mut self, layer: usize, block_count: usize) {
        self.layers[layer].truncate(block_count);
    }

    /// Truncate every layer to `block_count` blocks.
    pub fn truncate(&mut self, block_count: usize) {
        for layer in &mut self.layers {
            layer.truncate(block_count);
        }
    }

    /// Concatenate `addr`'s blocks onto every layer.
    pub fn append(&mut self, addr: &BlockTable) {
        if addr.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = addr.clone();
            return;
        }
        assert_eq!(
            self.layers.len(),
            addr.layers.len(),
            "append of a {}-layer table onto a {}-layer table",
            addr.layers.len(),
            self.layers.len()
        );
        assert_eq!(
            self.has_scale, addr.has_scale,
            "append mixes tables with and without scale blocks"
        );
        for (dst, src) in self.layers.iter_mut().zip(&addr.layers) {
            dst.k.extend_from_slice(&src.k);
            dst.v.extend_from_slice(&src.v);
            dst.k_scale.extend_from_slice(&src.k_scale);
            dst.v_scale.extend_from_slice(&src.v_scale);
        }
    }

    /// Remove and return the last `n` blocks of every layer, keyed by layer.
    pub(crate) fn pop_back(&mut self, n: usize) -> Vec<Vec<usize>> {
        self.layers
            .iter_mut()
            .map(|layer| {
                let keep = layer.k.len().saturating_sub(n);
                let popped = layer.k.split_off(keep);
                layer.v.truncate(keep);
                layer.k_scale.truncate(keep);
                layer.v_scale.truncate(keep);
                popped
            })
            .collect()
    }

    /// Drop the given block ids from every layer, keeping the order of the rest.
    pub(crate) fn remove_blocks(&mut self, ids: &[usize]) {
        for layer in &mut self.layers {
            let keep: Vec<bool> = layer.k.iter().map(|id| !ids.contains(id)).collect();
            for list in [
                &mut layer.k,
                &mut layer.v,
                &mut layer.k_scale,
                &mut layer.v_scale,
            ] {
                let mut i = 0;
                list.retain(|_| {
                    let k = keep.get(i).copied().unwrap_or(true);
                    i += 1;
                    k
                });
            }
        }
    }

    pub fn layer_num(&self) -> usize {
        self.layers.len()
    }

    /// Block count of layer 0, which all layers share outside of a per-layer resize.
    pub fn block_num(&self) -> usize {
        self.layers.first().map_or(0, |l| l.k.len())
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.k.is_empty())
    }

    pub fn has_scale(&self) -> bool {
        self.has_scale
    }

    pub(crate) fn layers(&self) -> &[LayerBlocks] {
        &self.layers
    }

    pub fn layer(&self, layer: usize) -> &LayerBlocks {
        &self.layers[layer]
    }

    pub fn k_blocks(&self, layer: usize) -> &[usize] {
        &self.layers[layer].k
    }

    pub fn v_blocks(&self, layer: usize) -> &[usize] {
        &self.layers[layer].v
    }

    pub fn k_scale_blocks(&self, layer: usize) -> &[usize] {
        &self.layers[layer].k_scale
    }

    pub fn v_scale_blocks(&self, layer: usize) -> &[usize] {
        &self.layers[layer].v_scale
    }

    pub fn debug_string(&self) -> String {
        let mut out = String::from("BlockTable {");
        let sections: [(&str, fn(&LayerBlocks) -> &Vec<usize>); 4] = [
            ("k", |l| &l.k),
            ("v", |l| &l.v),
            ("k_scale", |l| &l.k_scale),
            ("v_scale", |l| &l.v_scale),
        ];
        for (name, get) in sections {
            let _ = write!(out, "{name}: ");
            write_layers(&mut out, &self.layers, get);
        }
        out.push('}');
        out
    }
}

pub(crate) fn write_layers(
    out: &mut String,
    layers: &[LayerBlocks],
    get: fn(&LayerBlocks) -> &Vec<usize>,
) {
    for (j, layer) in layers.iter().enumerate() {
        let _ = write!(out, "layer:{j};");
        for id in get(layer) {
            let _ = write!(out, "{id}, ");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles(layers: usize, block: usize, scale: bool) -> Vec<BlockHandles> {
        vec![BlockHandles::same(block, scale); layers]
    }

    #[test]
    fn test_push_back_keeps_layers_aligned() {
        let mut t = BlockTable::default();
        t.push_back(&handles(3, 4, false));
        t.push_back(&handles(3, 7, false));
        assert_eq!(t.layer_num(), 3);
        assert_eq!(t.block_num(), 2);
        for l in 0..3 {
            assert_eq!(t.k_blocks(l), &[4, 7]);
            assert_eq!(t.v_blocks(l), &[4, 7]);
            assert!(t.k_scale_blocks(l).is_empty());
        }
    }

    #[test]
    fn test_push_back_with_scale() {
        let mut t = BlockTable::default();
        t.push_back(&handles(2, 5, true));
        assert!(t.has_scale());
        assert_eq!(t.k_scale_blocks(1), &[5]);
        assert_eq!(t.v_scale_blocks(0), &[5]);
    }

    #[test]
    #[should_panic]
    fn test_push_back_layer_mismatch_panics() {
        let mut t = BlockTable::default();
        t.push_back(&handles(2, 1, false));
        t.push_back(&handles(3, 2, false));
    }

    #[test]
    #[should_panic]
    fn test_push_back_scale_mismatch_panics() {
        let mut t = BlockTable::default();
        t.push_back(&handles(2, 1, false));
        t.push_back(&handles(2, 2, true));
    }

    #[test]
    fn test_resize_to_zero_then_push() {
        let mut t = BlockTable::uniform(2, &[1, 2, 3], false);
        t.truncate(0);
        assert!(t.is_empty());
        t.push_back(&handles(2, 9, false));
        assert_eq!(t.k_blocks(0), &[9]);
        assert_eq!(t.v_blocks(1), &[9]);
    }

    #[test]
    fn test_resize_single_layer() {
        let mut t = BlockTable::uniform(2, &[1, 2, 3], true);
        t.resize(1, 1);
        assert_eq!(t.k_blocks(0), &[1, 2, 3]);
        assert_eq!(t.k_blocks(1), &[1]);
        assert_eq!(t.v_scale_blocks(1), &[1]);
    }

    #[test]
    #[should_panic(expected = "resize can only shrink")]
    fn test_resize_growth_panics() {
        let mut t = BlockTable::uniform(1, &[1], false);
        t.resize(0, 2);
    }

    #[test]
    fn test_append_round_trip() {
        let prefix = BlockTable::uniform(2, &[1, 2], false);
        let tail = BlockTable::uniform(2, &[5], false);
        let mut t = BlockTable::default();
        t.append(&prefix);
        assert_eq!(t, prefix);
        t.append(&tail);
        assert_eq!(t.k_blocks(1), &[1, 2, 5]);
        t.truncate(prefix.block_num());
        assert_eq!(t, prefix);
    }

    #[test]
    fn test_pop_back() {
        let mut t = BlockTable::uniform(2, &[1, 2, 3], false);
        let popped = t.pop_back(2);
        assert_eq!(popped, vec![vec![2, 3], vec![2, 3]]);
        assert_eq!(t.k_blocks(1), &[1]);
        assert_eq!(t.pop_back(5), vec![vec![1], vec![1]]);
        assert!(t.is_empty());
    }

    #[test]
    fn test_debug_string() {
        let t = BlockTable::uniform(1, &[3, 4], false);
        assert_eq!(
            t.debug_string(),
            "BlockTable {k: layer:0;3, 4, v: layer:0;3, 4, k_scale: layer:0;v_scale: layer:0;}"
        );
    }
}
