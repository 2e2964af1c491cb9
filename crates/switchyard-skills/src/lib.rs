//! Concrete collaborators for switchyard-core: mock model providers, help-center
//! knowledge, support tools, a keyword classifier and the human hand-off queue.

mod classifier;
mod desk;
mod handoff;
mod knowledge;
mod model;
mod tools;

pub use classifier::{extract_params, KeywordClassifier};
pub use desk::{
    default_providers, default_routes, SupportDesk, HELP_CENTER, PRIMARY_MODEL, SECONDARY_MODEL,
};
pub use handoff::{HandoffQueue, QueuedHandoff};
pub use knowledge::{Article, KnowledgeProvider, StaticKnowledgeBase};
pub use model::MockModelProvider;
pub use tools::{
    support_tools, CreateTicket, GetOrder, IssueRefund, SendNotification, SupportBackend,
};
