pub mod document;
pub mod lock;
pub mod store;

pub use document::{CertPaths, Cluster, Config, Context, Endpoint, User};
pub use store::{CHANGE_NONE_USER_ENV, KUBECONFIG_ENV, KubeconfigStore, change_none_user};
