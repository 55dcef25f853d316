//! taskflow-rt: a heterogeneous task-graph executor.
//!
//! Accepts a directed task graph — a DAG with controlled cyclic extensions
//! via conditional branches and dynamically spawned subflows — and runs its
//! nodes on a fixed pool of worker threads partitioned into domains (a HOST
//! domain always, a CUDA domain when the `cuda` feature is enabled), using
//! per-worker work-stealing deques with a per-domain global overflow queue.
//!
//! Building the graph itself (node/edge construction, callable type erasure)
//! is this crate's [`node::GraphBuilder`]; everything about *scheduling* it —
//! join-counter dependency resolution, cross-domain hand-off, condition
//! branches, joined/detached subflows, repeated/conditional re-runs — lives
//! in [`Executor`].
//!
//! ```
//! use taskflow_rt::{Domain, Executor, GraphBuilder};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let exe = Executor::new(2).unwrap();
//! let ran = Arc::new(AtomicUsize::new(0));
//! let ran2 = Arc::clone(&ran);
//!
//! let mut b = GraphBuilder::new();
//! let a = b.static_task(Domain::Host, move || {
//!     ran2.fetch_add(1, Ordering::SeqCst);
//! });
//! let _ = a;
//! let graph = b.build();
//!
//! exe.run(graph).wait().unwrap();
//! assert_eq!(ran.load(Ordering::SeqCst), 1);
//! ```

pub mod channel;
pub mod deque;
pub mod domain;
pub mod error;
pub mod executor;
pub mod future;
pub mod node;
pub mod notifier;
pub mod observer;
pub mod panic_boundary;
pub mod topology;
pub mod worker;

pub use domain::Domain;
pub use error::{ExecutorError, RunError};
pub use executor::{Config, Executor};
pub use future::RunFuture;
pub use node::{Graph, GraphBuilder, NodeId, Subflow, TaskHandle};
pub use observer::{Observer, TaskView};
