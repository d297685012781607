pub mod cluster_types;
pub mod job_types;
pub mod trigger_types;

pub const API_GROUP: &str = "middleware.io";
pub const API_VERSION: &str = "middleware.io/v1alpha1";
