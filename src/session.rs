//! Session identity and persona catalogue
//!
//! A session id is opaque, stable across reconnects and URL-addressable. It is
//! either read from the page URL, injected by the caller, or freshly generated.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Query parameter carrying the session id in page and connection URLs
pub const SESSION_QUERY_PARAM: &str = "session_id";

/// Opaque session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an injected id. Empty or whitespace-only ids are rejected.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Read the `session_id` query parameter from a URL, if present
    pub fn from_url(url: &str) -> Option<Self> {
        let parsed = Url::parse(url).ok()?;
        parsed
            .query_pairs()
            .find(|(k, _)| k == SESSION_QUERY_PARAM)
            .and_then(|(_, v)| Self::new(v.into_owned()))
    }

    /// Resolve the session id: explicit value, then URL, then a fresh id
    pub fn resolve(injected: Option<&str>, page_url: Option<&str>) -> Self {
        injected
            .and_then(|id| Self::new(id))
            .or_else(|| page_url.and_then(Self::from_url))
            .unwrap_or_else(Self::generate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Assistant personality tag.
///
/// The backend is authoritative: a tag it confirms that we do not know about
/// is kept verbatim as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Persona {
    #[default]
    Developer,
    Aizen,
    Luffy,
    Politician,
    Other(String),
}

impl Persona {
    /// Built-in personas in display order
    pub const BUILTIN: [Persona; 4] = [
        Persona::Developer,
        Persona::Aizen,
        Persona::Luffy,
        Persona::Politician,
    ];

    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "developer" => Persona::Developer,
            "aizen" => Persona::Aizen,
            "luffy" => Persona::Luffy,
            "politician" => Persona::Politician,
            _ => Persona::Other(tag.trim().to_string()),
        }
    }

    /// Wire tag echoed to the backend
    pub fn tag(&self) -> &str {
        match self {
            Persona::Developer => "developer",
            Persona::Aizen => "aizen",
            Persona::Luffy => "luffy",
            Persona::Politician => "politician",
            Persona::Other(tag) => tag,
        }
    }

    /// Human display name
    pub fn display_name(&self) -> &str {
        match self {
            Persona::Developer => "Developer",
            Persona::Aizen => "Sosuke Aizen",
            Persona::Luffy => "Monkey D. Luffy",
            Persona::Politician => "Politician",
            Persona::Other(tag) => tag,
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Per-page session: identity plus persona selection.
///
/// `requested_persona` is the local choice; `confirmed_persona` only changes
/// when the backend acknowledges it.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    requested_persona: Persona,
    confirmed_persona: Persona,
}

impl Session {
    pub fn new(id: SessionId, persona: Persona) -> Self {
        Self {
            id,
            requested_persona: persona.clone(),
            confirmed_persona: persona,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Backend may reassign the id on handshake
    pub fn reassign_id(&mut self, id: SessionId) {
        if id != self.id {
            log::info!("Session: id reassigned {} -> {}", self.id, id);
            self.id = id;
        }
    }

    pub fn requested_persona(&self) -> &Persona {
        &self.requested_persona
    }

    /// Persona currently displayed (backend confirmed)
    pub fn persona(&self) -> &Persona {
        &self.confirmed_persona
    }

    pub fn request_persona(&mut self, persona: Persona) {
        self.requested_persona = persona;
    }

    pub fn confirm_persona(&mut self, persona: Persona) {
        self.requested_persona = persona.clone();
        self.confirmed_persona = persona;
    }

    /// Build the connection URL carrying this session's id
    pub fn connect_url(&self, server_url: &str) -> Option<String> {
        let mut url = Url::parse(server_url).ok()?;
        let others: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != SESSION_QUERY_PARAM)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (k, v) in &others {
                pairs.append_pair(k, v);
            }
            pairs.append_pair(SESSION_QUERY_PARAM, self.id.as_str());
        }
        Some(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_url() {
        let id = SessionId::from_url("http://localhost:8000/?session_id=abc-123").unwrap();
        assert_eq!(id.as_str(), "abc-123");

        assert!(SessionId::from_url("http://localhost:8000/").is_none());
        assert!(SessionId::from_url("http://localhost:8000/?session_id=").is_none());
        assert!(SessionId::from_url("not a url").is_none());
    }

    #[test]
    fn test_resolve_prefers_injected_then_url() {
        let url = "http://localhost/?session_id=from-url";
        assert_eq!(
            SessionId::resolve(Some("injected"), Some(url)).as_str(),
            "injected"
        );
        assert_eq!(SessionId::resolve(None, Some(url)).as_str(), "from-url");
        assert_eq!(SessionId::resolve(Some("  "), Some(url)).as_str(), "from-url");

        let fresh = SessionId::resolve(None, None);
        assert!(Uuid::parse_str(fresh.as_str()).is_ok());
    }

    #[test]
    fn test_persona_tags_round_trip() {
        for persona in Persona::BUILTIN.iter() {
            assert_eq!(&Persona::from_tag(persona.tag()), persona);
        }
        assert_eq!(Persona::from_tag("LUFFY"), Persona::Luffy);
        assert_eq!(
            Persona::from_tag("pirate"),
            Persona::Other("pirate".to_string())
        );
        assert_eq!(Persona::Aizen.display_name(), "Sosuke Aizen");
    }

    #[test]
    fn test_persona_confirmation_is_authoritative() {
        let mut session = Session::new(SessionId::generate(), Persona::Developer);
        session.request_persona(Persona::Luffy);
        assert_eq!(session.persona(), &Persona::Developer);
        assert_eq!(session.requested_persona(), &Persona::Luffy);

        session.confirm_persona(Persona::Aizen);
        assert_eq!(session.persona(), &Persona::Aizen);
        assert_eq!(session.requested_persona(), &Persona::Aizen);
    }

    #[test]
    fn test_connect_url_carries_session_id() {
        let session = Session::new(SessionId::new("sid-1").unwrap(), Persona::Developer);
        let url = session
            .connect_url("ws://127.0.0.1:8000/ws/audio-stream?session_id=old&x=1")
            .unwrap();
        assert!(url.starts_with("ws://127.0.0.1:8000/ws/audio-stream?"));
        assert!(url.contains("x=1"));
        assert!(url.contains("session_id=sid-1"));
        assert!(!url.contains("old"));
    }
}
