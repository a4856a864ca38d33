pub mod error;
pub mod git;
pub mod ordering;
pub mod traits;

pub use error::{Result, VcsError};
pub use git::GitVcs;
pub use ordering::dependency_order;
pub use traits::{Integration, VersionControl, Workspace, WorkspaceStatus};
