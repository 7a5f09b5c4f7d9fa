//! Persisting entity graphs.
//!
//! A persist call flattens the caller's graph and the graph currently in the
//! database, diffs the two into a [`PersistOperation`] and runs that plan in
//! a fixed phase order:
//!
//! 1. [`GraphFlattener`] lists every instance reachable through loaded relations.
//! 2. [`MissingEntityLoader`] fetches db rows for identified entities the
//!    root's db graph did not contain.
//! 3. [`OperationPlanner`] computes inserts, updates, junction rows, foreign
//!    key fix-ups and removals.
//! 4. [`OperationExecutor`] runs the statements inside a transaction and
//!    writes generated values back.
//!
//! [`EntityPersister`] wires these together for one runner.

mod executor;
mod flatten;
mod missing;
mod operate;
mod operation;
mod persister;
mod planner;


pub use executor::OperationExecutor;
pub use flatten::GraphFlattener;
pub use missing::MissingEntityLoader;
pub use operate::EntityRef;
pub use operation::{
    InsertOperation, InverseUpdateKind, JunctionEnd, JunctionInsert, JunctionRemove,
    PersistOperation, PlanSummary, RemoveCause, RemoveKind, RemoveOperation, UpdateByInverseRelation,
    UpdateByRelation, UpdateOperation,
};
pub use persister::EntityPersister;
pub use planner::OperationPlanner;
