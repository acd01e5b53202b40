use tracing::debug;

use crate::bootstrap::{BootstrapOps, BootstrapResult};
use crate::error::BootstrapError;

/// Which engines can reach a peer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Reach(u8);

impl Reach {
    /// direct load/store interconnect (link engine)
    pub const LINK: Reach = Reach(1);
    /// network (RDMA engine)
    pub const RDMA: Reach = Reach(2);
    /// bulk copy queues (DMA engine)
    pub const DMA: Reach = Reach(4);
    pub const NONE: Reach = Reach(0);

    pub fn bits(&self) -> u8 {
        self.0
    }
    pub fn contains(&self, other: Reach) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
    pub fn has_link(&self) -> bool {
        self.contains(Reach::LINK)
    }
    pub fn has_rdma(&self) -> bool {
        self.contains(Reach::RDMA)
    }
    pub fn has_dma(&self) -> bool {
        self.contains(Reach::DMA)
    }
}

impl std::ops::BitOr for Reach {
    type Output = Reach;
    fn bitor(self, rhs: Reach) -> Reach {
        Reach(self.0 | rhs.0)
    }
}

/// The per-peer reachability bitmap of one PE
#[derive(Clone, Debug)]
pub struct Topology {
    my_pe: usize,
    pes_per_node: usize,
    bitmap: Vec<Reach>,
}

impl Topology {
    /// `pes_per_node == 0` puts every PE on one node
    pub fn new(my_pe: usize, num_pes: usize, pes_per_node: usize) -> Topology {
        let pes_per_node = if pes_per_node == 0 {
            num_pes.max(1)
        } else {
            pes_per_node
        };
        let bitmap = (0..num_pes)
            .map(|pe| {
                let mut reach = Reach::NONE;
                if pe / pes_per_node == my_pe / pes_per_node {
                    reach = reach | Reach::LINK | Reach::DMA;
                }
                if pe != my_pe {
                    reach = reach | Reach::RDMA;
                }
                reach
            })
            .collect();
        Topology {
            my_pe,
            pes_per_node,
            bitmap,
        }
    }

    pub fn reach(&self, pe: usize) -> Reach {
        self.bitmap.get(pe).copied().unwrap_or(Reach::NONE)
    }

    pub fn num_pes(&self) -> usize {
        self.bitmap.len()
    }

    pub fn pes_per_node(&self) -> usize {
        self.pes_per_node
    }

    pub fn node_of(&self, pe: usize) -> usize {
        pe / self.pes_per_node
    }

    /// PEs reachable through the link engine (self included)
    pub fn link_peers(&self) -> impl Iterator<Item = usize> + '_ {
        self.bitmap
            .iter()
            .enumerate()
            .filter(|(_, r)| r.has_link())
            .map(|(pe, _)| pe)
    }

    /// every PE exchanges its row and checks that reachability is symmetric
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn cross_check<B: BootstrapOps>(&self, bootstrap: &B) -> BootstrapResult<()> {
        let row: Vec<u8> = self.bitmap.iter().map(|r| r.bits()).collect();
        let all = bootstrap.allgather(&row)?;
        let n = self.bitmap.len();
        for (pe, their_row) in all.chunks_exact(n).enumerate() {
            if their_row[self.my_pe] != row[pe] {
                return Err(BootstrapError::Inconsistent(format!(
                    "topology between pe {} ({:#x}) and pe {} ({:#x})",
                    self.my_pe, row[pe], pe, their_row[self.my_pe]
                )));
            }
        }
        debug!("topology of pe {}: {:?}", self.my_pe, row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node() {
        let t = Topology::new(1, 4, 0);
        assert_eq!(t.reach(1).bits(), 5);
        assert_eq!(t.reach(0).bits(), 7);
        assert_eq!(t.link_peers().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(t.reach(9), Reach::NONE);
    }

    #[test]
    fn two_nodes() {
        let t = Topology::new(2, 4, 2);
        assert!(t.reach(0).has_rdma());
        assert!(!t.reach(0).has_link());
        assert!(!t.reach(1).has_dma());
        assert!(t.reach(3).has_link() && t.reach(3).has_dma() && t.reach(3).has_rdma());
        assert_eq!(t.link_peers().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(t.node_of(3), 1);
    }

    #[test]
    fn one_pe_per_node() {
        let t = Topology::new(0, 3, 1);
        assert_eq!(t.reach(0), Reach::LINK | Reach::DMA);
        assert_eq!(t.reach(1), Reach::RDMA);
    }
}
