use std::sync::{Arc, Barrier, Mutex};

use candle_core::{Result, Tensor};

/// Ranks of one tensor-parallel group living in the same process.
struct LocalGroup {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// Handle of one rank within a communicator group.
pub struct Comm {
    rank: usize,
    world_size: usize,
    group: Arc<LocalGroup>,
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl Comm {
    /// Single rank, all collectives are the identity.
    pub fn single() -> Arc<Self> {
        Self::local_group(1).remove(0)
    }

    /// Create `world_size` connected ranks. Hand each one to its own thread.
    pub fn local_group(world_size: usize) -> Vec<Arc<Self>> {
        let world_size = world_size.max(1);
        let group = Arc::new(LocalGroup {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        (0..world_size)
            .map(|rank| {
                Arc::new(Self {
                    rank,
                    world_size,
                    group: group.clone(),
                })
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }
}

/// Sum all-reduce over the ranks of a [`Comm`].
#[derive(Debug, Clone)]
pub struct SumAllReduce {
    comm: Arc<Comm>,
}

impl SumAllReduce {
    pub fn new(comm: &Arc<Comm>) -> Self {
        Self { comm: comm.clone() }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size
    }

    /// Every rank must call this with a tensor of the same shape; all ranks receive
    /// the elementwise sum, accumulated in rank order.
    pub fn sum_all_reduce(&self, xs: &Tensor) -> Result<Tensor> {
        if self.comm.world_size == 1 {
            return Ok(xs.clone());
        }
        let group = &self.comm.group;
        {
            let mut slots = lock_slots(group);
            slots[self.comm.rank] = Some(xs.clone());
        }
        group.barrier.wait();
        let summed = {
            let slots = lock_slots(group);
            let mut acc: Option<Tensor> = None;
            for (rank, slot) in slots.iter().enumerate() {
                let Some(t) = slot else {
                    candle_core::bail!("rank {rank} did not contribute to the all-reduce");
                };
                let t = t.to_device(xs.device())?;
                acc = Some(match acc {
                    Some(a) => (a + t)?,
                    None => t,
                });
            }
            acc
        };
        // All ranks must have read their sum before anyone overwrites a slot.
        group.barrier.wait();
        match summed {
            Some(t) => Ok(t),
            None => candle_core::bail!("empty communicator group"),
        }
    }
}

fn lock_slots(group: &LocalGroup) -> std::sync::MutexGuard<'_, Vec<Option<Tensor>>> {
    loop {
        if let Ok(inner) = group.slots.lock() {
            break inner;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_single_rank_is_identity() -> Result<()> {
        let comm = Comm::single();
        assert_eq!(comm.world_size(), 1);
        let x = Tensor::new(&[1f32, 2., 3.], &Device::Cpu)?;
        let y = SumAllReduce::new(&comm).sum_all_reduce(&x)?;
        assert_eq!(y.to_vec1::<f32>()?, vec![1., 2., 3.]);
        Ok(())
    }

    #[test]
    fn test_sum_across_threads() {
        let comms = Comm::local_group(3);
        let handles = comms
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || -> Result<Vec<Vec<f32>>> {
                    let reduce = SumAllReduce::new(&comm);
                    let r = comm.rank() as f32;
                    let mut out = Vec::new();
                    // Two rounds to check the slots are reusable.
                    for round in 0..2 {
                        let x = Tensor::new(&[r, r + round as f32], &Device::Cpu)?;
                        out.push(reduce.sum_all_reduce(&x)?.to_vec1::<f32>()?);
                    }
                    Ok(out)
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            let out = h.join().unwrap().unwrap();
            assert_eq!(out[0], vec![3., 3.]);
            assert_eq!(out[1], vec![3., 6.]);
        }
    }
}
