use super::error::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Opaque serialized argument or result value.
///
/// Payloads are produced by [`to_payload`] and only interpreted again by
/// [`from_payload`]; the backend stores and routes them without looking
/// inside.
pub type Payload = Vec<u8>;

/// Serializes a value into an opaque payload using JSON.
///
/// # Errors
/// Returns `CoreError::Serialization` if the value cannot be serialized.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Payload> {
    serde_json::to_vec(value).map_err(CoreError::Serialization)
}

/// Deserializes an opaque payload back into a value.
///
/// # Errors
/// Returns `CoreError::Deserialization` if the payload cannot be decoded.
pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(CoreError::Deserialization)
}

/// Converts caller arguments into the payload list carried by scheduling
/// events.
///
/// Implemented for the unit tuple and for one- and two-element tuples of
/// serializable values, plus a passthrough for pre-serialized payloads, so
/// call sites read `client.create_workflow_instance(opts, "wf", ("hello",))`.
pub trait IntoInputs {
    fn into_inputs(self) -> Result<Vec<Payload>>;
}

impl IntoInputs for () {
    fn into_inputs(self) -> Result<Vec<Payload>> {
        Ok(Vec::new())
    }
}

impl<A: Serialize> IntoInputs for (A,) {
    fn into_inputs(self) -> Result<Vec<Payload>> {
        Ok(vec![to_payload(&self.0)?])
    }
}

impl<A: Serialize, B: Serialize> IntoInputs for (A, B) {
    fn into_inputs(self) -> Result<Vec<Payload>> {
        Ok(vec![to_payload(&self.0)?, to_payload(&self.1)?])
    }
}

impl IntoInputs for Vec<Payload> {
    fn into_inputs(self) -> Result<Vec<Payload>> {
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let value = vec!["hello".to_string(), "world".to_string()];
        let payload = to_payload(&value).unwrap();
        let decoded: Vec<String> = from_payload(&payload).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_invalid_payload_rejected() {
        let result: Result<i64> = from_payload(b"not json");
        assert!(result.is_err());
    }
}
