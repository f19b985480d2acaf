//! Integration tests for the draftbench workbench engine

mod config_layering;
mod consent_gate;
mod draft_lifecycle;
mod recovery;
mod rpc_dispatch;
mod test_utils;
mod workshop_agent;
