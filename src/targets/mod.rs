//! Rotation targets
//!
//! Targets own the server-side credential: they mint new values on rotation
//! and deactivate superseded ones once consumers have moved on.
//! - AWS IAM user access keys (`aws-iam`)

mod aws_iam;

pub use aws_iam::{examine_keys, AccessKey, AccessKeys, AwsIam, AwsIamFactory};
pub use aws_iam::{ACCESS_KEY_NAME, SECRET_KEY_NAME};

use crate::plugin::Registry;

/// Register every built-in target under its package identifier.
pub fn register(registry: &mut Registry) {
    registry.register("aws-iam", AwsIamFactory);
}
