mod dispatching;
mod rule;

pub use dispatching::Dispatching;
pub use rule::{Rule, RuleImpl};
