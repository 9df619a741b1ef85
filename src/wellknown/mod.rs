//! Well-known SMTP service shortcuts.
//!
//! Maps a service name (or one of its aliases or sender domains) to the
//! provider's submission endpoint. Lookup keys are normalized to lowercase
//! alphanumerics, so `"Gmail"`, `"gmail"` and `"G-Mail"` all resolve.

/// Endpoint settings supplied by a well-known service entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Canonical service name.
    pub name: &'static str,
    /// Server hostname.
    pub host: &'static str,
    /// Server port.
    pub port: u16,
    /// Whether the endpoint expects implicit TLS.
    pub secure: bool,
}

struct Service {
    entry: ServiceEntry,
    aliases: &'static [&'static str],
    domains: &'static [&'static str],
}

const SERVICES: &[Service] = &[
    Service {
        entry: ServiceEntry {
            name: "Gmail",
            host: "smtp.gmail.com",
            port: 465,
            secure: true,
        },
        aliases: &["google", "googlemail"],
        domains: &["gmail.com", "googlemail.com"],
    },
    Service {
        entry: ServiceEntry {
            name: "Outlook365",
            host: "smtp.office365.com",
            port: 587,
            secure: false,
        },
        aliases: &["office365"],
        domains: &[],
    },
    Service {
        entry: ServiceEntry {
            name: "Hotmail",
            host: "smtp-mail.outlook.com",
            port: 587,
            secure: false,
        },
        aliases: &["outlook"],
        domains: &["hotmail.com", "outlook.com"],
    },
    Service {
        entry: ServiceEntry {
            name: "Yahoo",
            host: "smtp.mail.yahoo.com",
            port: 465,
            secure: true,
        },
        aliases: &[],
        domains: &["yahoo.com"],
    },
    Service {
        entry: ServiceEntry {
            name: "iCloud",
            host: "smtp.mail.me.com",
            port: 587,
            secure: false,
        },
        aliases: &["me"],
        domains: &["me.com", "mac.com", "icloud.com"],
    },
    Service {
        entry: ServiceEntry {
            name: "Zoho",
            host: "smtp.zoho.com",
            port: 465,
            secure: true,
        },
        aliases: &[],
        domains: &["zoho.com"],
    },
    Service {
        entry: ServiceEntry {
            name: "SES-US-EAST-1",
            host: "email-smtp.us-east-1.amazonaws.com",
            port: 465,
            secure: true,
        },
        aliases: &["ses"],
        domains: &[],
    },
    Service {
        entry: ServiceEntry {
            name: "SES-EU-WEST-1",
            host: "email-smtp.eu-west-1.amazonaws.com",
            port: 465,
            secure: true,
        },
        aliases: &[],
        domains: &[],
    },
    Service {
        entry: ServiceEntry {
            name: "SendGrid",
            host: "smtp.sendgrid.net",
            port: 587,
            secure: false,
        },
        aliases: &[],
        domains: &[],
    },
    Service {
        entry: ServiceEntry {
            name: "Mailgun",
            host: "smtp.mailgun.org",
            port: 465,
            secure: true,
        },
        aliases: &[],
        domains: &[],
    },
    Service {
        entry: ServiceEntry {
            name: "FastMail",
            host: "smtp.fastmail.com",
            port: 465,
            secure: true,
        },
        aliases: &[],
        domains: &["fastmail.fm"],
    },
];

fn normalize(key: &str) -> String {
    key.chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_lowercase()
}

/// Resolves a service name, alias, or sender domain to its endpoint.
pub fn resolve(key: &str) -> Option<ServiceEntry> {
    let normalized = normalize(key);
    if normalized.is_empty() {
        return None;
    }

    for service in SERVICES {
        if normalize(service.entry.name) == normalized
            || service.aliases.iter().any(|a| normalize(a) == normalized)
            || service.domains.iter().any(|d| normalize(d) == normalized)
        {
            return Some(service.entry);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_and_punctuation_insensitive() {
        let a = resolve("Gmail").unwrap();
        let b = resolve("g-mail").unwrap();
        let c = resolve("GOOGLEMAIL").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.host, "smtp.gmail.com");
        assert!(a.secure);
    }

    #[test]
    fn lookup_by_domain() {
        let entry = resolve("hotmail.com").unwrap();
        assert_eq!(entry.host, "smtp-mail.outlook.com");
        assert_eq!(entry.port, 587);
        assert!(!entry.secure);
    }

    #[test]
    fn unknown_service_is_none() {
        assert!(resolve("not-a-real-service").is_none());
        assert!(resolve("").is_none());
    }
}
