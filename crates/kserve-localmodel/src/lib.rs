//! LocalModel controllers for KServe
//!
//! - [`nodegroup`]: reconciles each LocalModelNodeGroup into its volume, claim and agent DaemonSet
//! - [`webhook`]: admission rules for LocalModelCache and LocalModelNamespaceCache

pub mod nodegroup;
pub mod webhook;
