//! Authentication validation
//!
//! SPF evaluation against the connecting IP, DKIM signature structure
//! inspection, DMARC policy lookup, Received-chain routing analysis and
//! header anomaly detection, folded into an auth score (higher is better)
//! and a suspicion score (higher is worse), both clamped to 0-100.
//!
//! DNS failures degrade gracefully: SPF reports `temperror`, DMARC reports
//! "not found". No DNS outcome fails the validation as a whole.

use crate::Message;
use ipnetwork::Ipv4Network;
use regex::Regex;
use serde::Serialize;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use zpam_common::config::HeadersConfig;
use zpam_common::{extract_address, extract_domain};
use zpam_dns::{DnsCache, DnsError};

/// Recursion cap for `include:` chains
const MAX_INCLUDE_DEPTH: usize = 10;
/// MX exchanges resolved per mechanism
const MAX_MX_HOSTS: usize = 10;

// =============================================================================
// Result types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    #[default]
    None,
    TempError,
    PermError,
}

impl SpfResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpfOutcome {
    pub valid: bool,
    pub record: Option<String>,
    pub result: SpfResult,
    pub matched_ips: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DkimOutcome {
    /// A DKIM-Signature header was present
    pub present: bool,
    /// All of d=, s= and a= parsed out of the signature
    pub valid: bool,
    pub signatures: Vec<DkimSignatureInfo>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DkimSignatureInfo {
    pub domain: String,
    pub selector: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DmarcPolicy {
    #[default]
    None,
    Quarantine,
    Reject,
}

#[derive(Debug, Clone, Serialize)]
pub struct DmarcOutcome {
    pub found: bool,
    /// Policy satisfied under the permissive alignment rule
    pub valid: bool,
    pub policy: DmarcPolicy,
    pub alignment: String,
    pub percentage: u8,
}

impl Default for DmarcOutcome {
    fn default() -> Self {
        Self {
            found: false,
            valid: false,
            policy: DmarcPolicy::None,
            alignment: "relaxed".into(),
            percentage: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingAnalysis {
    pub hop_count: usize,
    pub suspicious_hops: Vec<RoutingIssue>,
    pub open_relay_hops: Vec<RoutingIssue>,
    pub reverse_dns_issues: Vec<RoutingIssue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingIssue {
    pub hop: usize,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthResult {
    pub spf: SpfOutcome,
    pub dkim: DkimOutcome,
    pub dmarc: DmarcOutcome,
    pub routing: RoutingAnalysis,
    pub anomalies: Vec<String>,
    /// 0-100, higher is better
    pub auth_score: u8,
    /// 0-100, higher is worse
    pub suspicion_score: u8,
    pub validated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_ms: u64,
}

// =============================================================================
// Validator
// =============================================================================

pub struct AuthValidator {
    dns: Arc<DnsCache>,
    config: HeadersConfig,
    dkim_domain: Regex,
    dkim_selector: Regex,
    dkim_algorithm: Regex,
    ip_pattern: Regex,
}

impl AuthValidator {
    pub fn new(dns: Arc<DnsCache>, config: HeadersConfig) -> Self {
        Self {
            dns,
            config,
            dkim_domain: Regex::new(r"\bd=([^;]+)").expect("static regex"),
            dkim_selector: Regex::new(r"\bs=([^;]+)").expect("static regex"),
            dkim_algorithm: Regex::new(r"\ba=([^;]+)").expect("static regex"),
            ip_pattern: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("static regex"),
        }
    }

    pub async fn validate(&self, message: &Message) -> AuthResult {
        let started = Instant::now();
        let mut result = AuthResult {
            validated_at: Some(chrono::Utc::now()),
            ..Default::default()
        };

        let sender_domain = message.sender_domain();
        let from_domain = {
            let from = extract_domain(&extract_address(message.from_header()));
            if from.is_empty() {
                sender_domain.clone()
            } else {
                from
            }
        };

        if self.config.enable_spf {
            result.spf = self
                .check_spf(&sender_domain, message.envelope.peer_addr)
                .await;
        }
        if self.config.enable_dkim {
            result.dkim = self.parse_dkim(message.headers.get("dkim-signature"));
        }
        if self.config.enable_dmarc {
            result.dmarc = self
                .check_dmarc(&from_domain, &result.spf, &result.dkim)
                .await;
        }
        result.routing = self.analyze_routing(message).await;
        result.anomalies = self.detect_anomalies(message);

        let (auth, suspicion) = self.compute_scores(&result);
        result.auth_score = auth;
        result.suspicion_score = suspicion;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    // -------------------------------------------------------------------------
    // SPF
    // -------------------------------------------------------------------------

    async fn check_spf(&self, domain: &str, peer: Option<IpAddr>) -> SpfOutcome {
        if domain.is_empty() {
            return SpfOutcome::default();
        }
        let record = match self.dns.spf_record(domain).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return SpfOutcome {
                    result: SpfResult::None,
                    ..Default::default()
                }
            }
            Err(_) => {
                return SpfOutcome {
                    result: SpfResult::TempError,
                    ..Default::default()
                }
            }
        };
        let Some(ip) = peer else {
            return SpfOutcome {
                record: Some(record),
                result: SpfResult::Neutral,
                ..Default::default()
            };
        };

        match self.eval_spf_record(&record, domain, ip, 0).await {
            Ok((result, matched_ips)) => SpfOutcome {
                valid: result == SpfResult::Pass,
                record: Some(record),
                result,
                matched_ips,
            },
            Err(_) => SpfOutcome {
                record: Some(record),
                result: SpfResult::TempError,
                ..Default::default()
            },
        }
    }

    /// Evaluate one SPF record left to right against `ip`.
    ///
    /// Boxed future: `include:` recurses through freshly fetched records.
    fn eval_spf_record<'a>(
        &'a self,
        record: &'a str,
        domain: &'a str,
        ip: IpAddr,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<(SpfResult, Vec<String>), DnsError>> + Send + 'a>>
    {
        Box::pin(async move {
            if depth > MAX_INCLUDE_DEPTH {
                return Ok((SpfResult::PermError, Vec::new()));
            }

            for term in record.split_whitespace().skip(1) {
                let (qualifier, mechanism) = split_qualifier(term);
                let mechanism = mechanism.to_lowercase();

                if mechanism == "all" {
                    return Ok((qualifier, Vec::new()));
                } else if let Some(cidr) = mechanism.strip_prefix("ip4:") {
                    if ip4_matches(ip, cidr) {
                        return Ok((qualifier, vec![cidr.to_string()]));
                    }
                } else if mechanism.starts_with("ip6:") {
                    // Recognized but never matched.
                } else if let Some(target) = mechanism.strip_prefix("include:") {
                    match self.dns.spf_record(target).await {
                        Ok(Some(inner)) => {
                            let (result, matched) =
                                self.eval_spf_record(&inner, target, ip, depth + 1).await?;
                            if result == SpfResult::Pass {
                                return Ok((qualifier, matched));
                            }
                        }
                        Ok(None) | Err(DnsError::NxDomain) => {}
                        Err(e) => return Err(e),
                    }
                } else if mechanism == "a" || mechanism.starts_with("a:") {
                    let target = mechanism.strip_prefix("a:").unwrap_or(domain);
                    if let Some(matched) = self.a_matches(target, ip).await? {
                        return Ok((qualifier, vec![matched]));
                    }
                } else if mechanism == "mx" || mechanism.starts_with("mx:") {
                    let target = mechanism.strip_prefix("mx:").unwrap_or(domain);
                    if let Some(matched) = self.mx_matches(target, ip).await? {
                        return Ok((qualifier, vec![matched]));
                    }
                }
                // Anything else (exists:, ptr:, redirect=, macros) is ignored.
            }
            Ok((SpfResult::Neutral, Vec::new()))
        })
    }

    async fn a_matches(&self, domain: &str, ip: IpAddr) -> Result<Option<String>, DnsError> {
        let IpAddr::V4(v4) = ip else { return Ok(None) };
        match self.dns.lookup_a(domain).await {
            Ok(addrs) if addrs.contains(&v4) => Ok(Some(v4.to_string())),
            Ok(_) | Err(DnsError::NxDomain) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn mx_matches(&self, domain: &str, ip: IpAddr) -> Result<Option<String>, DnsError> {
        let hosts = match self.dns.lookup_mx(domain).await {
            Ok(hosts) => hosts,
            Err(DnsError::NxDomain) => return Ok(None),
            Err(e) => return Err(e),
        };
        for host in hosts.iter().take(MAX_MX_HOSTS) {
            if let Some(matched) = self.a_matches(&host.exchange, ip).await? {
                return Ok(Some(matched));
            }
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // DKIM
    // -------------------------------------------------------------------------

    /// Structural inspection of the first DKIM-Signature header.
    ///
    /// Cryptographic verification is out of scope; a signature carrying
    /// d=, s= and a= is considered structurally valid.
    fn parse_dkim(&self, header: Option<&str>) -> DkimOutcome {
        let Some(signature) = header else {
            return DkimOutcome::default();
        };
        let capture = |regex: &Regex| {
            regex
                .captures(signature)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
        };
        let domain = capture(&self.dkim_domain);
        let selector = capture(&self.dkim_selector);
        let algorithm = capture(&self.dkim_algorithm);

        let valid = domain.is_some() && selector.is_some() && algorithm.is_some();
        DkimOutcome {
            present: true,
            valid,
            signatures: vec![DkimSignatureInfo {
                domain: domain.unwrap_or_default(),
                selector: selector.unwrap_or_default(),
                algorithm: algorithm.unwrap_or_default(),
            }],
        }
    }

    // -------------------------------------------------------------------------
    // DMARC
    // -------------------------------------------------------------------------

    async fn check_dmarc(
        &self,
        from_domain: &str,
        spf: &SpfOutcome,
        dkim: &DkimOutcome,
    ) -> DmarcOutcome {
        if from_domain.is_empty() {
            return DmarcOutcome::default();
        }
        // DNS errors degrade to "not found".
        let record = match self.dns.dmarc_record(from_domain).await {
            Ok(Some(record)) => record,
            Ok(None) | Err(_) => return DmarcOutcome::default(),
        };

        let mut outcome = DmarcOutcome {
            found: true,
            ..Default::default()
        };
        for tag in record.split(';') {
            let Some((key, value)) = tag.split_once('=') else {
                continue;
            };
            match (key.trim(), value.trim()) {
                ("p", "quarantine") => outcome.policy = DmarcPolicy::Quarantine,
                ("p", "reject") => outcome.policy = DmarcPolicy::Reject,
                ("p", _) => outcome.policy = DmarcPolicy::None,
                ("adkim", "s") => outcome.alignment = "strict".into(),
                ("adkim", _) => outcome.alignment = "relaxed".into(),
                ("pct", value) => outcome.percentage = value.parse().unwrap_or(100),
                _ => {}
            }
        }
        // Permissive alignment: either authenticated identity satisfies.
        outcome.valid = spf.result == SpfResult::Pass || dkim.valid;
        outcome
    }

    // -------------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------------

    async fn analyze_routing(&self, message: &Message) -> RoutingAnalysis {
        let received = message.headers.received();
        let mut analysis = RoutingAnalysis {
            hop_count: received.len(),
            ..Default::default()
        };

        for (hop, header) in received.iter().enumerate() {
            let lower = header.to_lowercase();
            for pattern in &self.config.suspicious_servers {
                if lower.contains(&pattern.to_lowercase()) {
                    analysis.suspicious_hops.push(RoutingIssue {
                        hop,
                        detail: format!("matched {:?}", pattern),
                    });
                    break;
                }
            }
            for pattern in &self.config.open_relay_patterns {
                if lower.contains(&pattern.to_lowercase()) {
                    analysis.open_relay_hops.push(RoutingIssue {
                        hop,
                        detail: format!("matched {:?}", pattern),
                    });
                    break;
                }
            }

            for candidate in self.ip_pattern.find_iter(header) {
                let Ok(ip) = candidate.as_str().parse::<Ipv4Addr>() else {
                    continue;
                };
                if ip.is_private() || ip.is_loopback() || ip.is_link_local() {
                    continue;
                }
                match self.dns.lookup_ptr(IpAddr::V4(ip)).await {
                    Ok(names) if !names.is_empty() => {}
                    _ => analysis.reverse_dns_issues.push(RoutingIssue {
                        hop,
                        detail: format!("no reverse dns for {}", ip),
                    }),
                }
            }
        }
        analysis
    }

    // -------------------------------------------------------------------------
    // Anomalies
    // -------------------------------------------------------------------------

    fn detect_anomalies(&self, message: &Message) -> Vec<String> {
        let mut anomalies = Vec::new();

        let from = message.from_header();
        if from.is_empty() {
            anomalies.push("missing From header".to_string());
        }
        if let Some(return_path) = message.headers.get("return-path") {
            let from_domain = extract_domain(&extract_address(from));
            let return_domain = extract_domain(&extract_address(return_path));
            if !from_domain.is_empty() && !return_domain.is_empty() && from_domain != return_domain
            {
                anomalies.push(format!(
                    "From domain {} differs from Return-Path domain {}",
                    from_domain, return_domain
                ));
            }
        }

        match message.headers.get("message-id") {
            None => anomalies.push("missing Message-ID header".to_string()),
            Some(id) => {
                let id = id.trim();
                let bracketed = id.starts_with('<') && id.ends_with('>');
                if !bracketed || !id.contains('@') {
                    anomalies.push("malformed Message-ID header".to_string());
                }
            }
        }

        match message.headers.get("date") {
            None => anomalies.push("missing Date header".to_string()),
            Some(date) => match chrono::DateTime::parse_from_rfc2822(date.trim()) {
                Ok(parsed) => {
                    let now = chrono::Utc::now();
                    let age = now.signed_duration_since(parsed.with_timezone(&chrono::Utc));
                    if age > chrono::Duration::days(7) {
                        anomalies.push("Date header more than 7 days in the past".to_string());
                    } else if age < chrono::Duration::hours(-24) {
                        anomalies.push("Date header more than 24 hours in the future".to_string());
                    }
                }
                Err(_) => anomalies.push("unparseable Date header".to_string()),
            },
        }

        anomalies
    }

    // -------------------------------------------------------------------------
    // Scoring
    // -------------------------------------------------------------------------

    fn compute_scores(&self, result: &AuthResult) -> (u8, u8) {
        let mut auth: i64 = 50;
        match result.spf.result {
            SpfResult::Pass => auth += 30,
            SpfResult::Fail => auth -= 20,
            SpfResult::SoftFail => auth -= 10,
            _ => {}
        }
        if result.dkim.valid {
            auth += 30;
        } else if result.dkim.present {
            auth -= 15;
        }
        if result.dmarc.found {
            if result.dmarc.valid {
                auth += 20;
            } else {
                auth -= 10;
            }
        }
        auth -= 5 * result.anomalies.len() as i64;

        let mut suspicion: i64 = 0;
        match result.spf.result {
            SpfResult::Fail => suspicion += 30,
            SpfResult::SoftFail => suspicion += 15,
            _ => {}
        }
        if result.dkim.present && !result.dkim.valid {
            suspicion += 20;
        }
        if result.dmarc.found && !result.dmarc.valid {
            suspicion += 25;
        }
        suspicion += 10 * result.routing.suspicious_hops.len() as i64;
        suspicion += 15 * result.routing.open_relay_hops.len() as i64;
        suspicion += 5 * result.routing.reverse_dns_issues.len() as i64;
        suspicion += 8 * result.anomalies.len() as i64;
        if result.routing.hop_count > self.config.max_hop_count {
            suspicion += 20;
        }

        (auth.clamp(0, 100) as u8, suspicion.clamp(0, 100) as u8)
    }
}

fn split_qualifier(term: &str) -> (SpfResult, &str) {
    match term.as_bytes().first() {
        Some(b'+') => (SpfResult::Pass, &term[1..]),
        Some(b'-') => (SpfResult::Fail, &term[1..]),
        Some(b'~') => (SpfResult::SoftFail, &term[1..]),
        Some(b'?') => (SpfResult::Neutral, &term[1..]),
        _ => (SpfResult::Pass, term),
    }
}

fn ip4_matches(ip: IpAddr, cidr: &str) -> bool {
    let IpAddr::V4(v4) = ip else { return false };
    if cidr.contains('/') {
        cidr.parse::<Ipv4Network>()
            .map(|network| network.contains(v4))
            .unwrap_or(false)
    } else {
        cidr.parse::<Ipv4Addr>().map(|addr| addr == v4).unwrap_or(false)
    }
}
