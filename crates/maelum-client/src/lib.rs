//! Client-side plumbing for the maelum network: the staged upload state
//! machine (with proof-of-work solving), the authenticated mailbox API,
//! and the account/organisation creation steppers.

pub mod api;
pub mod steps;

pub use api::{
    account_token, ClientError, IngestClient, MailboxClient, TicketGrant, TicketOutcome,
};
pub use steps::{run_org_steps, run_steps, AccountContext, AccountStep, OrgContext, OrgStep};
