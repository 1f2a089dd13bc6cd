//! Positional-field parser for `ImportProxyFile`: one server per line,
//! fields split on a caller-chosen separator.

use crate::types::{ImportOptions, ServerSpec};

/// Parse `content` into server specs per `options`. Unparsable lines
/// (too few fields, unparsable port with no usable default) are skipped
/// rather than failing the whole import.
pub fn parse(content: &str, options: &ImportOptions) -> Vec<ServerSpec> {
    let mut specs = Vec::new();

    for (index, raw_line) in content.lines().enumerate() {
        if options.skip_header && index == 0 {
            continue;
        }
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(options.separator).collect();
        if fields.len() <= options.skip_cols {
            continue;
        }

        let mut remaining = fields[options.skip_cols..].iter();
        let Some(host) = remaining.next().map(|s| s.trim()).filter(|s| !s.is_empty()) else {
            continue;
        };
        let port = remaining
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .unwrap_or(options.default_port);
        let username = remaining.next().map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string);
        let password = remaining.next().map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string);

        specs.push(ServerSpec {
            id: format!("{host}:{port}"),
            host: host.to_string(),
            port,
            username,
            password,
        });
    }

    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ImportOptions {
        ImportOptions { separator: ',', skip_cols: 0, default_port: 1080, skip_header: false }
    }

    #[test]
    fn parses_host_port_user_pass() {
        let specs = parse("1.2.3.4,8080,alice,secret", &options());
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].host, "1.2.3.4");
        assert_eq!(specs[0].port, 8080);
        assert_eq!(specs[0].username.as_deref(), Some("alice"));
        assert_eq!(specs[0].password.as_deref(), Some("secret"));
    }

    #[test]
    fn missing_port_uses_default() {
        let specs = parse("1.2.3.4", &options());
        assert_eq!(specs[0].port, 1080);
        assert_eq!(specs[0].username, None);
    }

    #[test]
    fn skip_cols_discards_leading_fields() {
        let mut opts = options();
        opts.skip_cols = 1;
        let specs = parse("ignored,1.2.3.4,9090", &opts);
        assert_eq!(specs[0].host, "1.2.3.4");
        assert_eq!(specs[0].port, 9090);
    }

    #[test]
    fn skip_header_ignores_first_line() {
        let mut opts = options();
        opts.skip_header = true;
        let specs = parse("host,port\n1.2.3.4,9090", &opts);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].host, "1.2.3.4");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let specs = parse("1.2.3.4,9090\n\n5.6.7.8,9091", &options());
        assert_eq!(specs.len(), 2);
    }
}
