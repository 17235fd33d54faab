use std::collections::HashMap;

/// Parameters worth re-deploying when a server connection moves between
/// clients. Everything else is advertised but not synced.
const TRACKED_PARAMETERS: [&str; 5] = [
    "application_name",
    "client_encoding",
    "DateStyle",
    "standard_conforming_strings",
    "TimeZone",
];

/// Map the all-lowercase spellings clients put in startup packets onto the
/// mixed-case names the server reports in ParameterStatus, so both sources
/// land on one key.
fn canonical_key(key: &str) -> Option<&'static str> {
    match key {
        "datestyle" => Some("DateStyle"),
        "timezone" => Some("TimeZone"),
        _ => None,
    }
}

fn is_tracked(key: &str) -> bool {
    TRACKED_PARAMETERS.contains(&key)
}

/// A GUC-like key/value set: the session's running state, a server's
/// advertised state, or a route's cached advertised set.
#[derive(Debug, Clone, Default)]
pub struct ServerParameters {
    parameters: HashMap<String, String>,
}

impl ServerParameters {
    pub fn new() -> Self {
        ServerParameters {
            parameters: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// If `startup` is false, only tracked parameters are recorded.
    pub fn set_param(&mut self, key: String, value: String, startup: bool) {
        let key = match canonical_key(&key) {
            Some(canonical) => canonical.to_string(),
            None => key,
        };

        if startup || is_tracked(&key) {
            self.parameters.insert(key, value);
        }
    }

    pub fn set_from_hashmap(&mut self, parameters: &HashMap<String, String>, startup: bool) {
        for (key, value) in parameters {
            self.set_param(key.to_string(), value.to_string(), startup);
        }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.parameters.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.parameters.iter()
    }

    /// Tracked parameters that `incoming` wants different from what this set
    /// currently holds. The result is what a deploy has to SET.
    pub fn diff_tracked(&self, incoming: &ServerParameters) -> Vec<(String, String)> {
        let mut diff = Vec::new();

        for key in TRACKED_PARAMETERS {
            let Some(wanted) = incoming.parameters.get(key) else {
                continue;
            };
            if self.parameters.get(key) != Some(wanted) {
                diff.push((key.to_string(), wanted.to_string()));
            }
        }

        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_keys_are_canonicalized() {
        let mut params = ServerParameters::new();
        params.set_param("timezone".into(), "UTC".into(), true);
        params.set_param("datestyle".into(), "ISO".into(), true);

        assert_eq!(params.get("TimeZone").map(String::as_str), Some("UTC"));
        assert_eq!(params.get("DateStyle").map(String::as_str), Some("ISO"));
        assert!(params.get("timezone").is_none());
    }

    #[test]
    fn untracked_parameters_need_startup_flag() {
        let mut params = ServerParameters::new();
        params.set_param("search_path".into(), "public".into(), false);
        assert!(params.is_empty());

        params.set_param("search_path".into(), "public".into(), true);
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn diff_only_reports_tracked_changes() {
        let mut server = ServerParameters::new();
        server.set_param("client_encoding".into(), "UTF8".into(), true);
        server.set_param("TimeZone".into(), "UTC".into(), true);

        let mut session = ServerParameters::new();
        session.set_param("client_encoding".into(), "LATIN1".into(), true);
        session.set_param("TimeZone".into(), "UTC".into(), true);
        session.set_param("search_path".into(), "app".into(), true);

        let diff = server.diff_tracked(&session);
        assert_eq!(diff, vec![("client_encoding".to_string(), "LATIN1".to_string())]);
    }

    #[test]
    fn diff_includes_keys_the_server_never_saw() {
        let server = ServerParameters::new();
        let mut session = ServerParameters::new();
        session.set_param("application_name".into(), "psql".into(), true);

        let diff = server.diff_tracked(&session);
        assert_eq!(
            diff,
            vec![("application_name".to_string(), "psql".to_string())]
        );
    }
}
