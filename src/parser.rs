//! Result document parser
//!
//! Streams nmap XML output into port records and OS guesses. The reader is
//! permissive: individual bad entries are skipped and counted, and only an
//! unreadable or structurally broken document is an error. Size and entry
//! ceilings bound the work done per document.

use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use std::{collections::HashMap, ops::ControlFlow, path::Path};
use tokio::io::AsyncReadExt;

use crate::{
    config::ParserConfig,
    core::{OrchestrationState, OsGuess, PortRecord, PortState, Protocol, ScanWarning, WarningKind},
    error::{Result, ScannerError},
};

/// Ceilings applied to every document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentLimits {
    pub max_document_bytes: u64,
    pub max_entries: usize,
}

impl From<&ParserConfig> for DocumentLimits {
    fn from(config: &ParserConfig) -> Self {
        Self {
            max_document_bytes: config.max_document_bytes,
            max_entries: config.max_port_entries,
        }
    }
}

/// Document text read within the size ceiling
#[derive(Debug, Clone)]
pub struct ResultDocument {
    pub source: String,
    pub text: String,
    /// The document was cut at the size ceiling
    pub truncated: bool,
}

impl ResultDocument {
    pub fn from_text<S: Into<String>, T: Into<String>>(source: S, text: T) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
            truncated: false,
        }
    }
}

/// Port entries extracted from one document
#[derive(Debug, Clone, Default)]
pub struct ParsedPorts {
    /// Every well-formed entry, in document order
    pub records: Vec<PortRecord>,
    pub warnings: Vec<ScanWarning>,
}

impl ParsedPorts {
    /// Open and open|filtered records keyed by port number
    ///
    /// When both protocols report the same port the TCP record wins and
    /// keeps the position of the first record seen for that port.
    pub fn open_ports(&self) -> Vec<PortRecord> {
        let mut ordered: Vec<PortRecord> = Vec::new();
        let mut index: HashMap<u16, usize> = HashMap::new();

        for record in self.records.iter().filter(|r| r.state.is_open()) {
            match index.get(&record.port) {
                Some(&pos) => {
                    if ordered[pos].protocol == Protocol::Udp && record.protocol == Protocol::Tcp {
                        ordered[pos] = record.clone();
                    }
                }
                None => {
                    index.insert(record.port, ordered.len());
                    ordered.push(record.clone());
                }
            }
        }
        ordered
    }
}

/// OS classifications extracted from one document
#[derive(Debug, Clone, Default)]
pub struct ParsedOsGuesses {
    pub guesses: Vec<OsGuess>,
    pub warnings: Vec<ScanWarning>,
}

#[derive(Debug, Default)]
struct PendingPort {
    portid: Option<String>,
    protocol: Option<String>,
    state: Option<String>,
    service: Option<String>,
}

enum EntryFate {
    Kept(PortRecord),
    Malformed,
    UnknownProtocol,
}

impl PendingPort {
    fn from_element(e: &BytesStart) -> Self {
        Self {
            portid: attribute(e, b"portid"),
            protocol: attribute(e, b"protocol"),
            ..Default::default()
        }
    }

    fn finish(self) -> EntryFate {
        let port = match self.portid.as_deref().map(|p| p.trim().parse::<u16>()) {
            Some(Ok(port)) => port,
            _ => return EntryFate::Malformed,
        };
        let protocol = match self.protocol.as_deref() {
            None => return EntryFate::Malformed,
            Some(raw) => match Protocol::parse(raw) {
                Some(protocol) => protocol,
                None => return EntryFate::UnknownProtocol,
            },
        };
        let state = self
            .state
            .as_deref()
            .map(PortState::parse)
            .unwrap_or(PortState::Unknown);
        EntryFate::Kept(PortRecord::new(port, protocol, state, self.service.as_deref()))
    }
}

fn attribute(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Parses nmap XML result documents
#[derive(Debug, Clone)]
pub struct ResultParser {
    limits: DocumentLimits,
}

impl ResultParser {
    pub fn new(limits: DocumentLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> DocumentLimits {
        self.limits
    }

    /// Read a document from disk, cutting it at the size ceiling
    pub async fn load(&self, path: &Path) -> Result<ResultDocument> {
        let source = path.display().to_string();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ScannerError::malformed_document(&source, format!("cannot open: {}", e)))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| ScannerError::malformed_document(&source, format!("cannot stat: {}", e)))?
            .len();

        let mut bytes = Vec::new();
        file.take(self.limits.max_document_bytes)
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| ScannerError::malformed_document(&source, format!("cannot read: {}", e)))?;

        Ok(ResultDocument {
            source,
            text: String::from_utf8_lossy(&bytes).into_owned(),
            truncated: size > self.limits.max_document_bytes,
        })
    }

    /// Extract port entries
    pub fn parse_ports(&self, document: &ResultDocument) -> Result<ParsedPorts> {
        let limit = self.limits.max_entries;
        let mut pending: Option<PendingPort> = None;
        let mut tally = PortTally::default();
        let mut limit_reached = false;

        let summary = walk(document, |element| {
            match element {
                Element::Open(e, self_closing) if e.name().as_ref() == b"port" => {
                    if tally.entries >= limit {
                        limit_reached = true;
                        return ControlFlow::Break(());
                    }
                    tally.entries += 1;
                    let port = PendingPort::from_element(e);
                    if self_closing {
                        tally.record(port.finish());
                    } else {
                        pending = Some(port);
                    }
                }
                Element::Open(e, _) => {
                    if let Some(port) = pending.as_mut() {
                        port.absorb(e);
                    }
                }
                Element::Close(name) if name == b"port" => {
                    if let Some(port) = pending.take() {
                        tally.record(port.finish());
                    }
                }
                Element::Close(_) => {}
            }
            ControlFlow::Continue(())
        })?;

        let phase = OrchestrationState::PortsParsed;
        let mut warnings = Vec::new();
        if summary.cut_short || document.truncated {
            warnings.push(ScanWarning::new(
                phase,
                WarningKind::DocumentTruncated,
                format!(
                    "{} exceeded {} bytes; parsed up to the cut",
                    document.source, self.limits.max_document_bytes
                ),
            ));
        }
        if limit_reached {
            warnings.push(ScanWarning::new(
                phase,
                WarningKind::EntryLimitReached,
                format!("Port limit reached ({}). Some ports may not be included.", limit),
            ));
        }
        if tally.malformed > 0 {
            warnings.push(ScanWarning::new(
                phase,
                WarningKind::MalformedEntry,
                format!("Skipped {} malformed port entries in {}", tally.malformed, document.source),
            ));
        }
        if tally.unknown_protocol > 0 {
            warnings.push(ScanWarning::new(
                phase,
                WarningKind::MalformedEntry,
                format!(
                    "Discarded {} port entries with unrecognized protocol in {}",
                    tally.unknown_protocol, document.source
                ),
            ));
        }

        tracing::debug!(
            source = %document.source,
            entries = tally.entries,
            kept = tally.records.len(),
            "Parsed port document"
        );

        Ok(ParsedPorts {
            records: tally.records,
            warnings,
        })
    }

    /// Extract OS classifications with accuracy above zero and a known type
    pub fn parse_os_guesses(&self, document: &ResultDocument) -> Result<ParsedOsGuesses> {
        let limit = self.limits.max_entries;
        let mut guesses = Vec::new();
        let mut seen = 0usize;
        let mut malformed = 0usize;
        let mut limit_reached = false;

        let summary = walk(document, |element| {
            if let Element::Open(e, _) = element {
                if e.name().as_ref() != b"osclass" {
                    return ControlFlow::Continue(());
                }
                if seen >= limit {
                    limit_reached = true;
                    return ControlFlow::Break(());
                }
                seen += 1;

                let accuracy = attribute(e, b"accuracy")
                    .and_then(|a| a.trim().parse::<u8>().ok())
                    .unwrap_or(0);
                let device_type = attribute(e, b"type");
                let Some(family) = attribute(e, b"osfamily") else {
                    malformed += 1;
                    return ControlFlow::Continue(());
                };

                match device_type {
                    Some(device_type) if accuracy > 0 && !device_type.eq_ignore_ascii_case("unknown") => {
                        let generation = attribute(e, b"osgen");
                        guesses.push(OsGuess {
                            name: format!(
                                "{}{}",
                                family.to_lowercase(),
                                generation.as_deref().unwrap_or_default().to_lowercase()
                            ),
                            family,
                            generation,
                            vendor: attribute(e, b"vendor"),
                            device_type,
                            accuracy,
                        });
                    }
                    _ => {}
                }
            }
            ControlFlow::Continue(())
        })?;

        let phase = OrchestrationState::OsScanning;
        let mut warnings = Vec::new();
        if summary.cut_short || document.truncated {
            warnings.push(ScanWarning::new(
                phase,
                WarningKind::DocumentTruncated,
                format!(
                    "{} exceeded {} bytes; parsed up to the cut",
                    document.source, self.limits.max_document_bytes
                ),
            ));
        }
        if limit_reached {
            warnings.push(ScanWarning::new(
                phase,
                WarningKind::EntryLimitReached,
                format!("OS class limit reached ({}). Some guesses may not be included.", limit),
            ));
        }
        if malformed > 0 {
            warnings.push(ScanWarning::new(
                phase,
                WarningKind::MalformedEntry,
                format!("Skipped {} osclass entries without a family in {}", malformed, document.source),
            ));
        }

        Ok(ParsedOsGuesses { guesses, warnings })
    }
}

impl PendingPort {
    fn absorb(&mut self, e: &BytesStart) {
        match e.name().as_ref() {
            b"state" => self.state = attribute(e, b"state"),
            b"service" => self.service = attribute(e, b"name"),
            _ => {}
        }
    }
}

#[derive(Default)]
struct PortTally {
    entries: usize,
    records: Vec<PortRecord>,
    malformed: usize,
    unknown_protocol: usize,
}

impl PortTally {
    fn record(&mut self, fate: EntryFate) {
        match fate {
            EntryFate::Kept(record) => self.records.push(record),
            EntryFate::Malformed => self.malformed += 1,
            EntryFate::UnknownProtocol => self.unknown_protocol += 1,
        }
    }
}

enum Element<'e> {
    /// Opening tag; the flag is set for self-closing elements
    Open(&'e BytesStart<'e>, bool),
    Close(&'e [u8]),
}

struct WalkSummary {
    /// Reading stopped at a syntax error inside a truncated document
    cut_short: bool,
}

/// Drive a visitor over element events, checking well-formedness
fn walk<F>(document: &ResultDocument, mut visit: F) -> Result<WalkSummary>
where
    F: FnMut(Element<'_>) -> ControlFlow<()>,
{
    let mut reader = Reader::from_str(&document.text);
    let mut depth = 0usize;
    let mut saw_element = false;
    let mut cut_short = false;

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) if document.truncated => {
                tracing::debug!(source = %document.source, "Stopped at truncation point: {}", e);
                cut_short = true;
                break;
            }
            Err(e) => {
                return Err(ScannerError::malformed_document(&document.source, e.to_string()));
            }
        };

        let flow = match &event {
            Event::Start(e) => {
                depth += 1;
                saw_element = true;
                visit(Element::Open(e, false))
            }
            Event::Empty(e) => {
                saw_element = true;
                visit(Element::Open(e, true))
            }
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                let name = e.name();
                visit(Element::Close(name.as_ref()))
            }
            Event::Eof => break,
            _ => ControlFlow::Continue(()),
        };

        if flow.is_break() {
            return Ok(WalkSummary { cut_short });
        }
    }

    if !saw_element {
        return Err(ScannerError::malformed_document(&document.source, "no elements found"));
    }
    if depth != 0 && !document.truncated {
        return Err(ScannerError::malformed_document(
            &document.source,
            "document ended with unclosed elements",
        ));
    }

    Ok(WalkSummary { cut_short })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parser() -> ResultParser {
        ResultParser::new(DocumentLimits {
            max_document_bytes: 50 * 1024 * 1024,
            max_entries: 1000,
        })
    }

    fn ports_doc(body: &str) -> ResultDocument {
        ResultDocument::from_text(
            "ports.xml",
            format!(
                r#"<?xml version="1.0"?><nmaprun><host><status state="up"/><ports>{}</ports></host></nmaprun>"#,
                body
            ),
        )
    }

    #[test]
    fn test_only_open_ports_in_map() {
        let doc = ports_doc(
            r#"<port protocol="tcp" portid="80"><state state="open"/><service name="http"/></port>
               <port protocol="udp" portid="53"><state state="closed"/><service name="domain"/></port>"#,
        );
        let parsed = parser().parse_ports(&doc).unwrap();
        assert_eq!(parsed.records.len(), 2);

        let open = parsed.open_ports();
        let map: Vec<_> = open.iter().map(|r| (r.port, r.service.as_deref())).collect();
        assert_eq!(map, vec![(80, Some("http"))]);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn test_open_filtered_kept_filtered_dropped() {
        let doc = ports_doc(
            r#"<port protocol="udp" portid="161"><state state="open|filtered"/><service name="snmp"/></port>
               <port protocol="tcp" portid="25"><state state="filtered"/><service name="smtp"/></port>"#,
        );
        let open = parser().parse_ports(&doc).unwrap().open_ports();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].port, 161);
        assert_eq!(open[0].state, PortState::OpenFiltered);
    }

    #[test]
    fn test_service_tokens_canonicalized() {
        let doc = ports_doc(
            r#"<port protocol="tcp" portid="5432"><state state="open"/><service name="PostgreSQL"/></port>
               <port protocol="tcp" portid="111"><state state="open"/><service name="rpcbind"/></port>"#,
        );
        let open = parser().parse_ports(&doc).unwrap().open_ports();
        assert_eq!(open[0].service.as_deref(), Some("pgsql"));
        assert_eq!(open[1].service.as_deref(), Some("rpc"));
    }

    #[test]
    fn test_malformed_entries_skipped_with_warning() {
        let doc = ports_doc(
            r#"<port protocol="tcp"><state state="open"/></port>
               <port protocol="tcp" portid="http"><state state="open"/></port>
               <port protocol="sctp" portid="38412"><state state="open"/></port>
               <port protocol="tcp" portid="22"><state state="open"/><service name="ssh"/></port>"#,
        );
        let parsed = parser().parse_ports(&doc).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].port, 22);

        let kinds: Vec<_> = parsed.warnings.iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![WarningKind::MalformedEntry, WarningKind::MalformedEntry]);
        assert!(parsed.warnings[0].message.contains("Skipped 2"));
    }

    #[test]
    fn test_tcp_wins_over_udp() {
        let doc = ports_doc(
            r#"<port protocol="udp" portid="53"><state state="open"/><service name="domain"/></port>
               <port protocol="tcp" portid="22"><state state="open"/><service name="ssh"/></port>
               <port protocol="tcp" portid="53"><state state="open"/><service name="domain-tcp"/></port>"#,
        );
        let open = parser().parse_ports(&doc).unwrap().open_ports();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].port, 53);
        assert_eq!(open[0].protocol, Protocol::Tcp);
        assert_eq!(open[1].port, 22);
    }

    #[test]
    fn test_not_well_formed_is_error() {
        let doc = ResultDocument::from_text("broken.xml", "<nmaprun><host><ports></host></nmaprun>");
        let err = parser().parse_ports(&doc).unwrap_err();
        assert_eq!(err.code(), "MALFORMED_DOCUMENT");

        let doc = ResultDocument::from_text("unclosed.xml", "<nmaprun><host>");
        assert!(parser().parse_ports(&doc).is_err());

        let doc = ResultDocument::from_text("text.xml", "Starting Nmap 7.94");
        assert!(parser().parse_ports(&doc).is_err());
    }

    #[test]
    fn test_entry_ceiling() {
        let body: String = (1..=5)
            .map(|p| format!(r#"<port protocol="tcp" portid="{}"><state state="open"/></port>"#, p))
            .collect();
        let parser = ResultParser::new(DocumentLimits {
            max_document_bytes: 1024 * 1024,
            max_entries: 3,
        });
        let parsed = parser.parse_ports(&ports_doc(&body)).unwrap();
        assert_eq!(parsed.records.len(), 3);
        assert_eq!(parsed.warnings.len(), 1);
        assert_eq!(parsed.warnings[0].kind, WarningKind::EntryLimitReached);
    }

    #[tokio::test]
    async fn test_truncated_document_parses_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ports.xml");
        let body: String = (1..=50)
            .map(|p| format!(r#"<port protocol="tcp" portid="{}"><state state="open"/></port>"#, p))
            .collect();
        tokio::fs::write(&path, ports_doc(&body).text).await.unwrap();

        let parser = ResultParser::new(DocumentLimits {
            max_document_bytes: 600,
            max_entries: 1000,
        });
        let document = parser.load(&path).await.unwrap();
        assert!(document.truncated);

        let parsed = parser.parse_ports(&document).unwrap();
        assert!(!parsed.records.is_empty());
        assert!(parsed.records.len() < 50);
        assert!(parsed
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::DocumentTruncated));
    }

    #[tokio::test]
    async fn test_missing_file_is_malformed_document() {
        let temp_dir = TempDir::new().unwrap();
        let err = parser().load(&temp_dir.path().join("absent.xml")).await.unwrap_err();
        assert_eq!(err.code(), "MALFORMED_DOCUMENT");
    }

    #[test]
    fn test_os_guess_filtering() {
        let doc = ResultDocument::from_text(
            "os.xml",
            r#"<nmaprun><host><os>
                <osmatch name="Linux 5.0 - 5.4" accuracy="96">
                  <osclass type="general purpose" vendor="Linux" osfamily="Linux" osgen="5.X" accuracy="96"><cpe>cpe:/o:linux:linux_kernel:5</cpe></osclass>
                </osmatch>
                <osclass type="unknown" vendor="Foo" osfamily="FooOS" osgen="1" accuracy="90"/>
                <osclass type="router" vendor="MikroTik" osfamily="RouterOS" osgen="6.X" accuracy="0"/>
                <osclass type="WAP" vendor="Cisco" osfamily="IOS" accuracy="85"/>
            </os></host></nmaprun>"#,
        );
        let parsed = parser().parse_os_guesses(&doc).unwrap();
        let names: Vec<_> = parsed.guesses.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["linux5.x", "ios"]);
        assert_eq!(parsed.guesses[0].accuracy, 96);
        assert_eq!(parsed.guesses[0].vendor.as_deref(), Some("Linux"));
    }

    #[test]
    fn test_os_warnings_tagged_with_os_phase() {
        let doc = ResultDocument::from_text(
            "os.xml",
            r#"<nmaprun><host><os>
                <osclass type="general purpose" vendor="Microsoft" accuracy="88"/>
                <osclass type="general purpose" vendor="Linux" osfamily="Linux" osgen="4.X" accuracy="91"/>
            </os></host></nmaprun>"#,
        );
        let parsed = parser().parse_os_guesses(&doc).unwrap();
        assert_eq!(parsed.guesses.len(), 1);
        assert_eq!(parsed.warnings.len(), 1);
        assert_eq!(parsed.warnings[0].kind, WarningKind::MalformedEntry);
        assert_eq!(parsed.warnings[0].phase, OrchestrationState::OsScanning);
    }
}
