use crate::error::ProtocolError;

pub fn validate_rpc_url(label: &str, value: &str) -> Result<(), ProtocolError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ProtocolError::Validation(format!(
            "{label} must start with http:// or https://"
        )))
    }
}

pub fn validate_nonzero(label: &str, value: u64) -> Result<(), ProtocolError> {
    if value == 0 {
        Err(ProtocolError::Validation(format!(
            "{label} must be greater than zero"
        )))
    } else {
        Ok(())
    }
}
