use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::MethodDescriptor;

/// Count parameters in a JVM method descriptor.
pub(crate) fn method_param_count(descriptor: &str) -> Result<usize> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    Ok(descriptor.parameter_types().len())
}

/// Reject strings that are not well-formed JVM method descriptors.
pub(crate) fn validate_method_descriptor(descriptor: &str) -> Result<()> {
    MethodDescriptor::from_str(descriptor)
        .with_context(|| format!("invalid method descriptor {descriptor:?}"))?;
    Ok(())
}
