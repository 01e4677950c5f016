/// Minimal domain normalization utilities
pub struct DomainUtils;

impl DomainUtils {
    /// Extract domain from email address
    pub fn extract_domain(email: &str) -> Option<String> {
        email
            .rsplit_once('@')
            .map(|(_, domain)| Self::normalize(domain))
            .filter(|domain| !domain.is_empty())
    }

    /// Lowercase, trim whitespace and angle brackets, drop the root dot
    pub fn normalize(domain: &str) -> String {
        domain
            .trim()
            .trim_matches(['<', '>'])
            .trim_end_matches('.')
            .to_ascii_lowercase()
    }

    /// Reduce an identifier that may be a full address to its domain
    pub fn identifier_domain(value: &str) -> String {
        Self::extract_domain(value).unwrap_or_else(|| Self::normalize(value))
    }

    /// Check if domain equals or is below `parent`
    pub fn is_same_or_subdomain(domain: &str, parent: &str) -> bool {
        let domain = Self::normalize(domain);
        let parent = Self::normalize(parent);
        domain == parent || domain.ends_with(&format!(".{parent}"))
    }
}
