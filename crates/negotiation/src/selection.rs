//! Mechanism list handling

/// Split a comma-joined mechanism list, dropping blank entries
pub fn parse_mechanism_list(list: &str) -> Vec<&str> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect()
}

pub fn join_mechanism_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|name| name.as_ref())
        .collect::<Vec<_>>()
        .join(",")
}

/// First entry of `preferences` that the server advertised
pub fn select_mechanism<'a, S: AsRef<str>>(preferences: &'a [S], advertised: &[&str]) -> Option<&'a str> {
    preferences
        .iter()
        .map(|name| name.as_ref())
        .find(|name| advertised.contains(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mechanism_list() {
        assert_eq!(parse_mechanism_list("GSSAPI"), vec!["GSSAPI"]);
        assert_eq!(
            parse_mechanism_list("GSSAPI, HMAC-SHA256"),
            vec!["GSSAPI", "HMAC-SHA256"]
        );
        assert!(parse_mechanism_list("").is_empty());
        assert!(parse_mechanism_list(",,").is_empty());
        assert_eq!(parse_mechanism_list(",PLAIN,"), vec!["PLAIN"]);
    }

    #[test]
    fn test_select_follows_client_preference() {
        let prefs = vec!["HMAC-SHA256".to_string(), "GSSAPI".to_string()];
        assert_eq!(
            select_mechanism(&prefs, &["GSSAPI", "HMAC-SHA256"]),
            Some("HMAC-SHA256")
        );
        assert_eq!(select_mechanism(&prefs, &["GSSAPI"]), Some("GSSAPI"));
        assert_eq!(select_mechanism(&prefs, &["PLAIN"]), None);
        assert_eq!(select_mechanism(&prefs, &[]), None);

        let none: Vec<String> = vec![];
        assert_eq!(select_mechanism(&none, &["GSSAPI"]), None);
    }

    #[test]
    fn test_join() {
        assert_eq!(join_mechanism_list(&["GSSAPI", "PLAIN"]), "GSSAPI,PLAIN");
        let empty: [&str; 0] = [];
        assert_eq!(join_mechanism_list(&empty), "");
    }
}
