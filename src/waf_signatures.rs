//! Static WAF fingerprint table and probe payloads
//!
//! Loaded into the binary as read-only data; nothing here is mutated at
//! runtime.

use serde::Serialize;

/// Fingerprint of one known WAF product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WafSignature {
    /// Stable identifier reported as the WAF type
    pub key: &'static str,
    pub name: &'static str,
    /// Response header names, compared case-insensitively
    pub headers: &'static [&'static str],
    /// Cookie name prefixes looked up in `Set-Cookie`
    pub cookies: &'static [&'static str],
    pub response_codes: &'static [u16],
    /// Lowercase substrings of the response body
    pub content_patterns: &'static [&'static str],
    /// Lowercase substrings of the `Server` header
    pub server_patterns: &'static [&'static str],
    pub weaknesses: &'static [&'static str],
    pub bypass_techniques: &'static [&'static str],
}

impl WafSignature {
    /// Number of passive indicators this signature can match on
    pub fn indicator_count(&self) -> usize {
        self.headers.len() + self.server_patterns.len() + self.content_patterns.len()
    }
}

pub static WAF_SIGNATURES: &[WafSignature] = &[
    WafSignature {
        key: "cloudflare",
        name: "Cloudflare",
        headers: &["cf-ray", "cf-cache-status"],
        cookies: &["__cfduid", "__cf_bm"],
        response_codes: &[403, 503],
        content_patterns: &["cloudflare", "attention required", "ray id"],
        server_patterns: &["cloudflare", "cloudflare-nginx"],
        weaknesses: &[
            "Origin IP discovery via DNS records",
            "Subdomain enumeration bypass",
            "HTTP/2 smuggling techniques",
            "Origin server direct access",
            "Rate limit bypass via distributed requests",
        ],
        bypass_techniques: &[
            "X-Originating-IP header manipulation",
            "X-Forwarded-For spoofing",
            "Unicode normalization bypasses",
            "HTTP parameter pollution",
            "Origin server discovery",
        ],
    },
    WafSignature {
        key: "aws_waf",
        name: "AWS WAF",
        headers: &["x-amzn-requestid", "x-amzn-trace-id"],
        cookies: &[],
        response_codes: &[403],
        content_patterns: &["blocked by aws waf", "aws"],
        server_patterns: &[],
        weaknesses: &[
            "Rule ordering vulnerabilities",
            "Rate limiting bypass via IP rotation",
            "Regional endpoint inconsistencies",
            "Custom rule logic flaws",
        ],
        bypass_techniques: &[
            "Request smuggling via chunked encoding",
            "Case variation bypasses",
            "Encoding bypasses (URL, Unicode)",
            "Geographic IP rotation",
            "HTTP method variations",
        ],
    },
    WafSignature {
        key: "akamai",
        name: "Akamai",
        headers: &["akamai-x-cache", "x-akamai-transformed"],
        cookies: &[],
        response_codes: &[403],
        content_patterns: &["access denied", "akamai"],
        server_patterns: &["akamaighost"],
        weaknesses: &[
            "Edge server configuration differences",
            "Cache pollution attacks",
            "Ghost domain bypass",
            "Geographic inconsistencies",
        ],
        bypass_techniques: &[
            "X-Forwarded-Host manipulation",
            "Host header injection",
            "Cache key poisoning",
            "Geographic endpoint rotation",
            "Protocol downgrade attacks",
        ],
    },
    WafSignature {
        key: "incapsula",
        name: "Incapsula",
        headers: &["x-iinfo"],
        cookies: &["visid_incap", "incap_ses"],
        response_codes: &[403],
        content_patterns: &["incapsula", "incident id"],
        server_patterns: &[],
        weaknesses: &[
            "Incident ID information leakage",
            "Session cookie predictability",
            "Rate limiting bypass",
            "Direct IP access",
        ],
        bypass_techniques: &[
            "X-Forwarded-For manipulation",
            "User-Agent rotation",
            "Referrer spoofing",
            "HTTP/2 downgrade",
            "Origin server discovery",
        ],
    },
    WafSignature {
        key: "mod_security",
        name: "ModSecurity",
        headers: &[],
        cookies: &[],
        response_codes: &[403, 406],
        content_patterns: &["mod_security", "modsecurity", "not acceptable"],
        server_patterns: &["mod_security", "modsecurity"],
        weaknesses: &[
            "Rule bypass via encoding",
            "Parameter pollution attacks",
            "Content-Type manipulation",
            "HTTP verb tampering",
            "Multipart boundary attacks",
        ],
        bypass_techniques: &[
            "Double URL encoding",
            "Unicode normalization",
            "Content-Type spoofing",
            "HTTP parameter pollution",
            "Multipart form bypasses",
            "SQL comment variations",
            "XSS filter evasion",
        ],
    },
    WafSignature {
        key: "barracuda",
        name: "Barracuda",
        headers: &["x-barracuda-url"],
        cookies: &[],
        response_codes: &[403],
        content_patterns: &["barracuda", "blocked by barracuda"],
        server_patterns: &[],
        weaknesses: &[
            "URL encoding bypass",
            "Case sensitivity issues",
            "Whitelist bypasses",
            "Geographic filtering weaknesses",
        ],
        bypass_techniques: &[
            "URL path traversal",
            "Case variation attacks",
            "HTTP header manipulation",
            "Protocol switching",
            "Geographic IP spoofing",
        ],
    },
    WafSignature {
        key: "f5_asm",
        name: "F5 Application Security Manager",
        headers: &["f5-x-forwarded-for"],
        cookies: &[],
        response_codes: &[403],
        content_patterns: &["f5", "the requested url was rejected"],
        server_patterns: &["bigip"],
        weaknesses: &[
            "iRule bypass techniques",
            "Load balancer inconsistencies",
            "Session persistence exploits",
            "Backend server differences",
        ],
        bypass_techniques: &[
            "X-Forwarded-Proto manipulation",
            "Backend server targeting",
            "Session cookie manipulation",
            "Load balancer bypass",
            "iRule logic exploitation",
        ],
    },
    WafSignature {
        key: "imperva",
        name: "Imperva SecureSphere",
        headers: &["x-iinfo"],
        cookies: &["incap_ses"],
        response_codes: &[403],
        content_patterns: &["imperva", "securesphere"],
        server_patterns: &[],
        weaknesses: &[
            "Learning mode bypass",
            "Policy inconsistencies",
            "Signature evasion",
            "Database firewall separation",
        ],
        bypass_techniques: &[
            "Signature fragmentation",
            "Protocol-level attacks",
            "Database-specific bypasses",
            "Application layer manipulation",
            "Time-based evasion",
        ],
    },
];

pub fn signatures() -> &'static [WafSignature] {
    WAF_SIGNATURES
}

pub fn find_signature(key: &str) -> Option<&'static WafSignature> {
    WAF_SIGNATURES.iter().find(|s| s.key == key)
}

/// Status codes treated as a blocked request
pub const BLOCK_CODES: [u16; 3] = [403, 406, 503];

pub fn is_block_code(status: u16) -> bool {
    BLOCK_CODES.contains(&status)
}

pub const GENERIC_WAF_TYPE: &str = "generic_waf";
pub const GENERIC_WAF_NAME: &str = "Generic WAF (Behavior-based detection)";
pub const POSSIBLE_WAF_TYPE: &str = "possible_waf";
pub const POSSIBLE_WAF_NAME: &str = "Possible WAF (Behavior-based detection)";

pub static GENERIC_WEAKNESSES: &[&str] = &[
    "May have bypass techniques via encoding",
    "Could be vulnerable to request method variations",
    "Possible rate limiting bypass opportunities",
];

pub static GENERIC_BYPASS_TECHNIQUES: &[&str] = &[
    "Try different HTTP methods (POST, PUT, PATCH)",
    "Use URL encoding variations",
    "Fragment payloads across parameters",
    "Use case variations in payloads",
];

/// Known-malicious payloads for one attack class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PayloadCategory {
    pub name: &'static str,
    pub payloads: &'static [&'static str],
}

pub static TEST_PAYLOADS: &[PayloadCategory] = &[
    PayloadCategory {
        name: "xss",
        payloads: &[
            "<script>alert('xss')</script>",
            "javascript:alert('xss')",
            "<img src=x onerror=alert('xss')>",
            "'+alert('xss')+'",
            "<svg onload=alert('xss')>",
        ],
    },
    PayloadCategory {
        name: "sql_injection",
        payloads: &[
            "' OR '1'='1",
            "1' UNION SELECT 1,2,3--",
            "'; DROP TABLE users; --",
            "1' AND 1=1--",
            "UNION SELECT NULL,NULL,NULL",
        ],
    },
    PayloadCategory {
        name: "command_injection",
        payloads: &["; cat /etc/passwd", "| whoami", "`id`", "$(whoami)", "; ls -la"],
    },
    PayloadCategory {
        name: "path_traversal",
        payloads: &[
            "../../../etc/passwd",
            "..\\..\\..\\windows\\system32\\drivers\\etc\\hosts",
            "%2e%2e%2f%2e%2e%2f%2e%2e%2fetc%2fpasswd",
            "....//....//....//etc/passwd",
        ],
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_signature_keys_unique() {
        let keys: HashSet<_> = signatures().iter().map(|s| s.key).collect();
        assert_eq!(keys.len(), WAF_SIGNATURES.len());
        assert_eq!(WAF_SIGNATURES.len(), 8);
    }

    #[test]
    fn test_patterns_are_lowercase() {
        for signature in signatures() {
            for pattern in signature
                .headers
                .iter()
                .chain(signature.content_patterns)
                .chain(signature.server_patterns)
            {
                assert_eq!(*pattern, pattern.to_lowercase(), "{}", signature.key);
            }
            assert!(!signature.headers.contains(&"server"), "{}", signature.key);
        }
    }

    #[test]
    fn test_lookup() {
        assert_eq!(find_signature("cloudflare").map(|s| s.name), Some("Cloudflare"));
        assert!(find_signature("generic_waf").is_none());
        assert!(is_block_code(406));
        assert!(!is_block_code(404));
    }

    #[test]
    fn test_payload_categories() {
        let names: Vec<_> = TEST_PAYLOADS.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["xss", "sql_injection", "command_injection", "path_traversal"]);
        assert!(TEST_PAYLOADS.iter().all(|c| c.payloads.len() >= 2));
    }
}
