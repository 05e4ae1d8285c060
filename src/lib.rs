//! # sandscan
//!
//! Detection and explanation of front-running / sandwich attacks on
//! EVM chains, built on [revm](https://github.com/bluealloy/revm).
//!
//! For each candidate pair of transactions (A, V), optionally with a
//! trailing profit-taking transaction P, the engine replays V (and P) in
//! two counterfactual scenarios, with and without A, over a state forked
//! from a live chain. When the profit oracle fires (the attacker gains and
//! the victim loses relative to the attack-free scenario), a second pass
//! taints the state variables A writes and V reads and propagates the
//! taint through data and control dependencies until it reaches the
//! consequence point that explains how the altered state changed V's
//! outcome.
//!
//! ## Layers
//!
//! - [`chain`]: the `BlockchainReader` interface, an RPC implementation
//!   and a TTL cache.
//! - [`engine`]: the instrumented transaction runner (`ExeVM`) and the
//!   forked/in-memory states it drives.
//! - [`tracing`]: the tracer interface over revm's inspector, message-call
//!   trees, trace locations and basic blocks.
//! - [`summary`]: per-call defs/uses/transfers/profits and their
//!   aggregation.
//! - [`dataflow`]: the taint engine: per-analyzer mirrors of the EVM
//!   state with a per-opcode flow policy.
//! - [`addressing`]: recovery of symbolic storage-addressing paths.
//! - [`hunt`]: the attack search, oracle and analysis pipeline.

pub mod addressing;
pub mod chain;
pub mod contract;
pub mod dataflow;
pub mod engine;
pub mod error;
pub mod hunt;
pub mod opcode;
pub mod summary;
pub mod tracing;

pub use chain::{BlockchainReader, CachedReader, RpcReader};
pub use engine::{ExeVM, ForkedState, MemoryState, Tx, VmConfig, VmContext, VmState};
pub use error::{AdmissionError, EngineError, ReaderError, SearchError, StateError};
pub use hunt::{Attack, AttackSearcher, SearchContext, TxHistory};
pub use summary::{TxSummary, TxSummaryTracer};
