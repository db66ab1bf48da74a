//! # Dialog-Info Documents (RFC 4235)
//!
//! A minimal implementation of the dialog event package payload,
//! `application/dialog-info+xml`, as delivered in NOTIFY bodies for
//! busy-lamp-field monitoring. Like the rest of this crate's XML
//! handling it is a purpose-built extractor, not a general XML parser:
//! the documents PBXes emit for BLF are flat and small.
//!
//! ## Example document
//!
//! ```xml
//! <?xml version="1.0"?>
//! <dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info"
//!              version="4" state="full" entity="sip:2001@example.net">
//!   <dialog id="a7b9" direction="recipient">
//!     <state>confirmed</state>
//!     <remote>
//!       <identity>sip:4002@example.net</identity>
//!       <target uri="sip:4002@example.net"/>
//!     </remote>
//!   </dialog>
//! </dialog-info>
//! ```
//!
//! ## Interpretation rules
//!
//! The softphone consumes the **first** `<dialog>` element only; a
//! document with no `<dialog>` element means the monitored extension is
//! idle, and a dialog without a `<state>` element is read as
//! `terminated` for the same reason.
//!
//! ```rust
//! use triline_sip::dialog_info::{DialogInfo, DialogState};
//!
//! let doc = DialogInfo::from_xml(r#"
//!     <dialog-info version="1" state="full" entity="sip:2001@example.net">
//!       <dialog id="x"><state>early</state></dialog>
//!     </dialog-info>"#).unwrap();
//! assert_eq!(doc.first_dialog_state(), DialogState::Early);
//! ```

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Dialog state values defined by RFC 4235 §3.7.1, plus the `hold`
/// extension several PBXes emit for confirmed-but-held dialogs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// Request sent, nothing heard yet
    Trying,
    /// A provisional response without a tag was received
    Proceeding,
    /// An early dialog exists (typically ringing)
    Early,
    /// The dialog is confirmed (call answered)
    Confirmed,
    /// Confirmed but held (non-RFC extension state)
    Hold,
    /// The dialog has ended, or never existed
    Terminated,
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogState::Trying => write!(f, "trying"),
            DialogState::Proceeding => write!(f, "proceeding"),
            DialogState::Early => write!(f, "early"),
            DialogState::Confirmed => write!(f, "confirmed"),
            DialogState::Hold => write!(f, "hold"),
            DialogState::Terminated => write!(f, "terminated"),
        }
    }
}

impl FromStr for DialogState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trying" => Ok(DialogState::Trying),
            "proceeding" => Ok(DialogState::Proceeding),
            "early" => Ok(DialogState::Early),
            "confirmed" => Ok(DialogState::Confirmed),
            "hold" => Ok(DialogState::Hold),
            "terminated" => Ok(DialogState::Terminated),
            other => Err(Error::parse(format!("unknown dialog state: {}", other))),
        }
    }
}

/// One `<dialog>` element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogElement {
    /// The `id` attribute
    pub id: String,
    /// The `<state>` text; absent elements read as terminated
    pub state: DialogState,
    /// The `<remote><target uri="..."/>` attribute, when present
    pub remote_target: Option<String>,
}

/// A parsed dialog-info document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogInfo {
    /// The monitored entity URI
    pub entity: String,
    /// Document version counter
    pub version: u32,
    /// `full` or `partial` notification state
    pub full: bool,
    /// Dialog elements in document order
    pub dialogs: Vec<DialogElement>,
}

impl DialogInfo {
    /// Parse a dialog-info document.
    ///
    /// This is a minimal extractor in the same spirit as the PIDF
    /// handling: attribute and element scanning over the raw text.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let root_start = xml
            .find("<dialog-info")
            .ok_or_else(|| Error::InvalidBody("no dialog-info root element".into()))?;
        let root_tag_end = xml[root_start..]
            .find('>')
            .map(|i| root_start + i)
            .ok_or_else(|| Error::InvalidBody("unterminated dialog-info tag".into()))?;
        let root_tag = &xml[root_start..=root_tag_end];

        let entity = extract_attribute(root_tag, "entity").unwrap_or_default();
        let version = extract_attribute(root_tag, "version")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let full = extract_attribute(root_tag, "state")
            .map(|s| s.eq_ignore_ascii_case("full"))
            .unwrap_or(true);

        let mut dialogs = Vec::new();
        let mut cursor = root_tag_end;
        while let Some(start) = xml[cursor..].find("<dialog ").or_else(|| xml[cursor..].find("<dialog>")) {
            let start = cursor + start;
            let end = match xml[start..].find("</dialog>") {
                Some(i) => start + i + "</dialog>".len(),
                None => break,
            };
            let element = &xml[start..end];
            let open_end = element.find('>').unwrap_or(0);

            let id = extract_attribute(&element[..=open_end], "id").unwrap_or_default();
            // absent <state> means the dialog is gone, i.e. idle
            let state = extract_element(element, "state")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DialogState::Terminated);
            let remote_target = element
                .find("<remote>")
                .and_then(|r| {
                    let remote = &element[r..];
                    let t = remote.find("<target")?;
                    let tag_end = remote[t..].find('>')? + t;
                    extract_attribute(&remote[t..=tag_end], "uri")
                });

            dialogs.push(DialogElement { id, state, remote_target });
            cursor = end;
        }

        Ok(DialogInfo { entity, version, full, dialogs })
    }

    /// Render back to canonical XML (used to check parse/publish fixed
    /// points in tests)
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\"?>\n");
        out.push_str(&format!(
            "<dialog-info xmlns=\"urn:ietf:params:xml:ns:dialog-info\" version=\"{}\" state=\"{}\" entity=\"{}\">\n",
            self.version,
            if self.full { "full" } else { "partial" },
            escape_xml(&self.entity)
        ));
        for dialog in &self.dialogs {
            out.push_str(&format!("  <dialog id=\"{}\">\n", escape_xml(&dialog.id)));
            out.push_str(&format!("    <state>{}</state>\n", dialog.state));
            if let Some(target) = &dialog.remote_target {
                out.push_str("    <remote>\n");
                out.push_str(&format!("      <target uri=\"{}\"/>\n", escape_xml(target)));
                out.push_str("    </remote>\n");
            }
            out.push_str("  </dialog>\n");
        }
        out.push_str("</dialog-info>");
        out
    }

    /// State of the first dialog element; [`DialogState::Terminated`]
    /// when the document carries none (extension idle)
    pub fn first_dialog_state(&self) -> DialogState {
        self.dialogs
            .first()
            .map(|d| d.state)
            .unwrap_or(DialogState::Terminated)
    }

    /// Remote target of the first dialog element, if any
    pub fn first_remote_target(&self) -> Option<&str> {
        self.dialogs.first().and_then(|d| d.remote_target.as_deref())
    }
}

fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    let needle = format!("{}=\"", name);
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')? + start;
    Some(unescape_xml(&tag[start..end]))
}

fn extract_element(xml: &str, name: &str) -> Option<String> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(unescape_xml(xml[start..end].trim()))
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIRMED: &str = r#"<?xml version="1.0"?>
<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="7" state="full" entity="sip:4001@example.net">
  <dialog id="zxcvb" direction="recipient">
    <state>confirmed</state>
    <remote>
      <identity>sip:2000@example.net</identity>
      <target uri="sip:2000@example.net"/>
    </remote>
  </dialog>
</dialog-info>"#;

    #[test]
    fn parses_confirmed_dialog_with_target() {
        let doc = DialogInfo::from_xml(CONFIRMED).unwrap();
        assert_eq!(doc.entity, "sip:4001@example.net");
        assert_eq!(doc.version, 7);
        assert!(doc.full);
        assert_eq!(doc.first_dialog_state(), DialogState::Confirmed);
        assert_eq!(doc.first_remote_target(), Some("sip:2000@example.net"));
    }

    #[test]
    fn empty_dialog_list_means_idle() {
        let doc = DialogInfo::from_xml(
            r#"<dialog-info version="1" state="full" entity="sip:x@y"></dialog-info>"#,
        )
        .unwrap();
        assert!(doc.dialogs.is_empty());
        assert_eq!(doc.first_dialog_state(), DialogState::Terminated);
    }

    #[test]
    fn missing_state_element_reads_terminated() {
        let doc = DialogInfo::from_xml(
            r#"<dialog-info version="1" state="full" entity="sip:x@y">
                 <dialog id="d1"></dialog>
               </dialog-info>"#,
        )
        .unwrap();
        assert_eq!(doc.first_dialog_state(), DialogState::Terminated);
    }

    #[test]
    fn only_first_dialog_is_consumed() {
        let doc = DialogInfo::from_xml(
            r#"<dialog-info version="2" state="full" entity="sip:x@y">
                 <dialog id="a"><state>early</state></dialog>
                 <dialog id="b"><state>confirmed</state></dialog>
               </dialog-info>"#,
        )
        .unwrap();
        assert_eq!(doc.dialogs.len(), 2);
        assert_eq!(doc.first_dialog_state(), DialogState::Early);
    }

    #[test]
    fn parse_render_parse_is_a_fixed_point() {
        let doc = DialogInfo::from_xml(CONFIRMED).unwrap();
        let again = DialogInfo::from_xml(&doc.to_xml()).unwrap();
        assert_eq!(doc.first_dialog_state(), again.first_dialog_state());
        assert_eq!(doc.entity, again.entity);
        assert_eq!(doc.dialogs.len(), again.dialogs.len());
    }

    #[test]
    fn rejects_non_dialog_info_documents() {
        assert!(DialogInfo::from_xml("<presence entity=\"x\"/>").is_err());
    }
}
