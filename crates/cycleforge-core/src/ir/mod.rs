pub mod model;
pub mod node;

pub use model::{DecisionFlip, Direction, Model, ModelState, MutationKind, PermutationMove};
pub use node::{
    Choice, Decision, DecisionKind, MemBase, MemRef, Node, NodeId, Op, Operand, PROJ_HI, PROJ_LO,
};
