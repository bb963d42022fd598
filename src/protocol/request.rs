//! Parameters carried by Register and Update requests.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::BindingMode;
use crate::dm::DmSnapshot;

/// Location path assigned by the server in the Register response
/// (e.g. `/rd/5a3f`), used to address Update and De-register.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointPath(Vec<String>);

impl EndpointPath {
    /// Create from path segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Path segments in order
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether no path was assigned
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EndpointPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// Registration parameters as of the last successful Register or Update
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateParameters {
    /// Registration lifetime in seconds
    pub lifetime_s: i64,
    /// Binding mode
    pub binding_mode: BindingMode,
    /// Data model snapshot advertised to the server
    pub dm: DmSnapshot,
}

impl UpdateParameters {
    /// Lifetime as a duration (non-positive lifetimes map to zero)
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_s.max(0) as u64)
    }
}

/// Register request parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterRequest {
    /// LwM2M version
    pub lwm2m_version: String,
    /// Client endpoint name
    pub endpoint_name: String,
    /// Lifetime in seconds
    pub lifetime_s: i64,
    /// Binding mode
    pub binding_mode: BindingMode,
    /// MSISDN for SMS bindings
    pub sms_msisdn: Option<String>,
    /// Objects and instances to advertise
    pub objects: DmSnapshot,
}

impl RegisterRequest {
    /// Build a Register request for `params`
    pub fn new(
        endpoint_name: &str,
        lwm2m_version: &str,
        sms_msisdn: Option<&str>,
        params: &UpdateParameters,
    ) -> Self {
        let uses_sms = params.binding_mode.uses(super::ConnectionType::Sms);
        Self {
            lwm2m_version: lwm2m_version.to_string(),
            endpoint_name: endpoint_name.to_string(),
            lifetime_s: params.lifetime_s,
            binding_mode: params.binding_mode,
            sms_msisdn: sms_msisdn.filter(|_| uses_sms).map(str::to_string),
            objects: params.dm.clone(),
        }
    }

    /// Uri-Query arguments in the order the server expects them
    pub fn query_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("lwm2m={}", self.lwm2m_version),
            format!("ep={}", self.endpoint_name),
        ];
        if self.lifetime_s > 0 {
            args.push(format!("lt={}", self.lifetime_s));
        }
        args.push(format!("b={}", self.binding_mode));
        if let Some(msisdn) = &self.sms_msisdn {
            args.push(format!("sms={msisdn}"));
        }
        args
    }
}

/// Update request parameters; only values that changed are present
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateRequest {
    /// New lifetime, if changed
    pub lifetime_s: Option<i64>,
    /// New binding mode, if changed
    pub binding_mode: Option<BindingMode>,
    /// New object list, if changed
    pub objects: Option<DmSnapshot>,
}

impl UpdateRequest {
    /// Compute what changed between the last registered parameters and `next`
    pub fn between(previous: Option<&UpdateParameters>, next: &UpdateParameters) -> Self {
        match previous {
            None => Self {
                lifetime_s: Some(next.lifetime_s),
                binding_mode: Some(next.binding_mode),
                objects: Some(next.dm.clone()),
            },
            Some(prev) => Self {
                lifetime_s: (prev.lifetime_s != next.lifetime_s).then_some(next.lifetime_s),
                binding_mode: (prev.binding_mode != next.binding_mode)
                    .then_some(next.binding_mode),
                objects: (prev.dm != next.dm).then(|| next.dm.clone()),
            },
        }
    }

    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.lifetime_s.is_none() && self.binding_mode.is_none() && self.objects.is_none()
    }

    /// Uri-Query arguments for the changed values
    pub fn query_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(lifetime) = self.lifetime_s {
            args.push(format!("lt={lifetime}"));
        }
        if let Some(binding) = self.binding_mode {
            args.push(format!("b={binding}"));
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::ObjectEntry;

    fn params(lifetime_s: i64, binding_mode: BindingMode) -> UpdateParameters {
        UpdateParameters {
            lifetime_s,
            binding_mode,
            dm: DmSnapshot::new(vec![ObjectEntry::new(1, vec![0]), ObjectEntry::new(3, vec![0])]),
        }
    }

    #[test]
    fn test_endpoint_path_display() {
        let path = EndpointPath::new(["rd", "5a3f"]);
        assert_eq!(path.to_string(), "/rd/5a3f");
        assert!(EndpointPath::default().is_empty());
    }

    #[test]
    fn test_register_query_args() {
        let request = RegisterRequest::new("urn:dev:1", "1.0", Some("+48123"), &params(60, BindingMode::U));
        assert_eq!(request.query_args(), vec!["lwm2m=1.0", "ep=urn:dev:1", "lt=60", "b=U"]);

        let request = RegisterRequest::new("urn:dev:1", "1.0", Some("+48123"), &params(60, BindingMode::US));
        assert_eq!(
            request.query_args(),
            vec!["lwm2m=1.0", "ep=urn:dev:1", "lt=60", "b=US", "sms=+48123"]
        );
    }

    #[test]
    fn test_update_between_unchanged() {
        let p = params(60, BindingMode::U);
        let request = UpdateRequest::between(Some(&p), &p);
        assert!(request.is_empty());
        assert!(request.query_args().is_empty());
    }

    #[test]
    fn test_update_between_changed_lifetime() {
        let old = params(60, BindingMode::U);
        let new = params(120, BindingMode::U);
        let request = UpdateRequest::between(Some(&old), &new);
        assert_eq!(request.lifetime_s, Some(120));
        assert_eq!(request.binding_mode, None);
        assert_eq!(request.objects, None);
        assert_eq!(request.query_args(), vec!["lt=120"]);
    }

    #[test]
    fn test_update_between_changed_objects() {
        let old = params(60, BindingMode::U);
        let mut new = params(60, BindingMode::UQ);
        new.dm = DmSnapshot::new(vec![ObjectEntry::new(1, vec![0])]);
        let request = UpdateRequest::between(Some(&old), &new);
        assert_eq!(request.binding_mode, Some(BindingMode::UQ));
        assert!(request.objects.is_some());
    }

    #[test]
    fn test_lifetime_clamped() {
        assert_eq!(params(-5, BindingMode::U).lifetime(), Duration::ZERO);
        assert_eq!(params(30, BindingMode::U).lifetime(), Duration::from_secs(30));
    }
}
