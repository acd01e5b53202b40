use std::sync::OnceLock;

use serde::Deserialize;

fn default_heap_size() -> usize {
    64 * 1024 * 1024
}

fn default_host_heap_size() -> usize {
    0
}

fn default_barrier() -> BarrierAlgorithm {
    BarrierAlgorithm::Pull
}

fn default_barrier_fanout() -> usize {
    8
}

fn default_num_cores() -> usize {
    4
}

fn default_pes_per_node() -> usize {
    0
}

fn default_link_scratch_size() -> usize {
    16 * 1024
}

fn default_dma_block_size() -> usize {
    1024 * 1024
}

fn default_dma_queue_depth() -> usize {
    2048
}

fn default_dma_poll_cap() -> u64 {
    1_000_000
}

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_backend() -> Backend {
    Backend::Sim
}

fn default_job_id() -> usize {
    0
}

/// The cross-device barrier algorithm used by `barrier`/`barrier_all`
#[derive(Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum BarrierAlgorithm {
    /// pairwise dissemination, one signal per round, O(log N) rounds
    Dissem,
    /// k-ary dissemination with the per-round signals spread over the compute cores
    Group,
    /// every PE publishes one counter and a subset of cores polls everyone else's
    Pull,
}

/// The memory/bootstrap backend a context is built on
#[derive(Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// every PE is a thread of the current process
    Sim,
    /// every PE is a process on the current node, memory shared through POSIX shared memory
    Shmem,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Symmetric heap bytes available to `malloc` on every PE, default: 64 MiB
    #[serde(default = "default_heap_size")]
    pub heap_size: usize,

    /// Bytes of the optional host-side heap kind, 0 disables it. default: 0
    #[serde(default = "default_host_heap_size")]
    pub host_heap_size: usize,

    /// The cross-device barrier algorithm: dissem, group or pull. default: pull
    #[serde(default = "default_barrier")]
    pub barrier: BarrierAlgorithm,

    /// The fan-out used by the group and pull barriers, clamped to [2,8]. default: 8
    #[serde(default = "default_barrier_fanout")]
    pub barrier_fanout: usize,

    /// The number of compute cores taking part in a kernel launch (max 48). default: 4
    #[serde(default = "default_num_cores")]
    pub num_cores: usize,

    /// The number of PEs sharing the direct interconnect, 0 means all of them. default: 0
    #[serde(default = "default_pes_per_node")]
    pub pes_per_node: usize,

    /// Size in bytes of the link engine scratch buffer. default: 16 KiB
    #[serde(default = "default_link_scratch_size")]
    pub link_scratch_size: usize,

    /// Bytes moved by a single DMA descriptor. default: 1 MiB
    #[serde(default = "default_dma_block_size")]
    pub dma_block_size: usize,

    /// Depth of each per-core DMA submission queue. default: 2048
    #[serde(default = "default_dma_queue_depth")]
    pub dma_queue_depth: usize,

    /// Number of completion polls before a DMA transfer is abandoned. default: 1000000
    #[serde(default = "default_dma_poll_cap")]
    pub dma_poll_cap: u64,

    /// A general timeout in seconds after which a wait reports a potential deadlock, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// sim -- every PE is a thread of one process
    /// shmem -- every PE is a process on one node
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// Namespace for shared memory object names
    #[serde(default = "default_job_id")]
    pub job_id: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            heap_size: default_heap_size(),
            host_heap_size: default_host_heap_size(),
            barrier: default_barrier(),
            barrier_fanout: default_barrier_fanout(),
            num_cores: default_num_cores(),
            pes_per_node: default_pes_per_node(),
            link_scratch_size: default_link_scratch_size(),
            dma_block_size: default_dma_block_size(),
            dma_queue_depth: default_dma_queue_depth(),
            dma_poll_cap: default_dma_poll_cap(),
            deadlock_timeout: default_deadlock_timeout(),
            backend: default_backend(),
            job_id: default_job_id(),
        }
    }
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("PGAS_SHMEM_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_env_defaults() {
        let config = envy::prefixed("PGAS_SHMEM_TEST_UNSET_")
            .from_iter::<_, Config>(Vec::<(String, String)>::new())
            .unwrap();
        let default = Config::default();
        assert_eq!(config.heap_size, default.heap_size);
        assert_eq!(config.barrier, BarrierAlgorithm::Pull);
        assert_eq!(config.dma_poll_cap, 1_000_000);
        assert_eq!(config.backend, Backend::Sim);
    }

    #[test]
    fn parses_env_values() {
        let vars = vec![
            ("PGAS_SHMEM_BARRIER".to_owned(), "group".to_owned()),
            ("PGAS_SHMEM_HEAP_SIZE".to_owned(), "1048576".to_owned()),
            ("PGAS_SHMEM_BACKEND".to_owned(), "shmem".to_owned()),
        ];
        let config = envy::prefixed("PGAS_SHMEM_")
            .from_iter::<_, Config>(vars)
            .unwrap();
        assert_eq!(config.barrier, BarrierAlgorithm::Group);
        assert_eq!(config.heap_size, 1 << 20);
        assert_eq!(config.backend, Backend::Shmem);
    }
}
