use std::collections::HashMap;

use minidom::Element;
use thiserror::Error;
use tracing::{debug, warn};

use crate::addr::{Address, BareKey};
use crate::error::StanzaError;
use crate::stanza::{iq_get, iq_set, new_id, ns, Stanza};

/// A field a service may require before it accepts a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationField {
    Username,
    Password,
    Email,
    Nickname,
}

impl RegistrationField {
    const ALL: [RegistrationField; 4] = [
        RegistrationField::Username,
        RegistrationField::Password,
        RegistrationField::Email,
        RegistrationField::Nickname,
    ];

    /// The element name the field travels under in `jabber:iq:register`.
    pub fn tag(&self) -> &'static str {
        match self {
            RegistrationField::Username => "username",
            RegistrationField::Password => "password",
            RegistrationField::Email => "email",
            RegistrationField::Nickname => "nickname",
        }
    }
}

/// What a service asked for: its instructions text and the fields it listed,
/// each possibly pre-filled with a suggested value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    pub instructions: Option<String>,
    pub fields: Vec<RequiredField>,
}

impl Requirements {
    pub fn requires(&self, field: RegistrationField) -> bool {
        self.fields.iter().any(|required| required.field == field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredField {
    pub field: RegistrationField,
    pub suggested: Option<String>,
}

/// The values the user filled in for a submission.
#[derive(Debug, Clone, Default)]
pub struct RegistrationValues {
    pub username: Option<String>,
    pub password: Option<String>,
    pub email: Option<String>,
    pub nickname: Option<String>,
}

impl RegistrationValues {
    fn get(&self, field: RegistrationField) -> Option<&str> {
        match field {
            RegistrationField::Username => self.username.as_deref(),
            RegistrationField::Password => self.password.as_deref(),
            RegistrationField::Email => self.email.as_deref(),
            RegistrationField::Nickname => self.nickname.as_deref(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// Submission attempted before the service told us what it needs.
    #[error("registration requirements for {0} are not known yet")]
    RequirementsUnknown(String),

    /// A field the service requires was left blank.
    #[error("required registration field {0:?} is missing")]
    MissingField(RegistrationField),
}

pub type RequirementsCallback = Box<dyn FnOnce(Result<Requirements, StanzaError>) + Send>;
pub type SubmitCallback = Box<dyn FnOnce(Result<(), StanzaError>) + Send>;

struct RegistrationSession {
    target: Address,
    /// Opaque continuation key some services issue with their form; echoed
    /// back verbatim on submission.
    key: Option<String>,
    requirements: Option<Requirements>,
    waiting: Vec<RequirementsCallback>,
    submit_waiting: Vec<SubmitCallback>,
}

/// Per-service registration conversations, keyed by the service address.
#[derive(Default)]
pub struct RegistrationManager {
    sessions: HashMap<BareKey, RegistrationSession>,
}

impl RegistrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask a service what it requires. Returns the query to send, or `None`
    /// when the answer is already cached (the callback has fired) or a query
    /// is already in flight (the callback is queued behind it).
    pub fn request_requirements(
        &mut self,
        target: &Address,
        callback: RequirementsCallback,
    ) -> Option<(String, Element)> {
        let key = BareKey::from(target);

        if let Some(session) = self.sessions.get_mut(&key) {
            match &session.requirements {
                Some(requirements) => {
                    debug!(target = %key, "requirements already known");
                    callback(Ok(requirements.clone()));
                }
                None => session.waiting.push(callback),
            }
            return None;
        }

        self.sessions.insert(
            key,
            RegistrationSession {
                target: target.bare(),
                key: None,
                requirements: None,
                waiting: vec![callback],
                submit_waiting: Vec::new(),
            },
        );

        let id = new_id();
        let query = Element::builder("query", ns::REGISTER).build();
        Some((id.clone(), iq_get(&id, Some(&target.bare()), query)))
    }

    /// Handle the reply to a requirements query.
    pub fn on_requirements_reply(&mut self, target: &BareKey, stanza: &Stanza) {
        let Some(session) = self.sessions.get_mut(target) else {
            return;
        };

        if stanza.has_error() {
            let error = map_register_error(stanza.error_code());
            warn!(target = %target, %error, "requirements query failed");
            let mut session = self
                .sessions
                .remove(target)
                .expect("session present above");
            for callback in session.waiting.drain(..) {
                callback(Err(error.clone()));
            }
            return;
        }

        let mut requirements = Requirements::default();
        if let Some(query) = stanza.payload("query", ns::REGISTER) {
            requirements.instructions = query
                .get_child("instructions", ns::REGISTER)
                .map(Element::text)
                .filter(|text| !text.is_empty());
            session.key = query
                .get_child("key", ns::REGISTER)
                .map(Element::text)
                .filter(|text| !text.is_empty());

            for field in RegistrationField::ALL {
                if let Some(child) = query.get_child(field.tag(), ns::REGISTER) {
                    let suggested = Some(child.text()).filter(|text| !text.is_empty());
                    requirements.fields.push(RequiredField { field, suggested });
                }
            }
        }

        session.requirements = Some(requirements.clone());
        for callback in session.waiting.drain(..) {
            callback(Ok(requirements.clone()));
        }
    }

    /// Submit filled-in values. Fails fast when the requirements are unknown
    /// or a required field is blank; otherwise returns the set query to send.
    pub fn submit(
        &mut self,
        target: &Address,
        values: &RegistrationValues,
        callback: SubmitCallback,
    ) -> Result<(String, Element), RegistrationError> {
        let key = BareKey::from(target);
        let Some(session) = self.sessions.get_mut(&key) else {
            return Err(RegistrationError::RequirementsUnknown(key.to_string()));
        };
        let Some(requirements) = &session.requirements else {
            return Err(RegistrationError::RequirementsUnknown(key.to_string()));
        };

        let mut query = Element::builder("query", ns::REGISTER);
        if let Some(continuation) = &session.key {
            query = query.append(
                Element::builder("key", ns::REGISTER)
                    .append(continuation.as_str())
                    .build(),
            );
        }
        for required in &requirements.fields {
            let Some(value) = values.get(required.field) else {
                return Err(RegistrationError::MissingField(required.field));
            };
            query = query.append(
                Element::builder(required.field.tag(), ns::REGISTER)
                    .append(value)
                    .build(),
            );
        }

        session.submit_waiting.push(callback);
        let id = new_id();
        Ok((id.clone(), iq_set(&id, Some(&session.target), query.build())))
    }

    /// Handle the reply to a submission.
    pub fn on_submit_reply(&mut self, target: &BareKey, stanza: &Stanza) {
        let Some(session) = self.sessions.get_mut(target) else {
            return;
        };

        let result = if stanza.has_error() {
            Err(map_register_error(stanza.error_code()))
        } else {
            debug!(target = %target, "registration accepted");
            Ok(())
        };
        for callback in session.submit_waiting.drain(..) {
            callback(result.clone());
        }
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

fn map_register_error(code: Option<u16>) -> StanzaError {
    match code {
        Some(401) => StanzaError::Unauthorized,
        Some(409) => StanzaError::DuplicateUser,
        Some(404) | Some(503) => StanzaError::Unavailable,
        Some(code) => StanzaError::Specific(code),
        None => StanzaError::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn gateway() -> (Address, BareKey) {
        let addr = Address::parse("aim.example.com").expect("parse");
        let key = BareKey::from(&addr);
        (addr, key)
    }

    fn stanza(xml: &str) -> Stanza {
        Stanza::parse(xml.as_bytes()).expect("stanza should parse")
    }

    fn requirements_recorder() -> (
        RequirementsCallback,
        Arc<Mutex<Vec<Result<Requirements, StanzaError>>>>,
    ) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let inner = calls.clone();
        let callback = Box::new(move |result| {
            inner.lock().expect("lock").push(result);
        });
        (callback, calls)
    }

    fn submit_recorder() -> (SubmitCallback, Arc<Mutex<Vec<Result<(), StanzaError>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let inner = calls.clone();
        let callback = Box::new(move |result| {
            inner.lock().expect("lock").push(result);
        });
        (callback, calls)
    }

    fn form_reply(children: &str) -> Stanza {
        stanza(&format!(
            "<iq xmlns='jabber:client' type='result' id='r' from='aim.example.com'>\
             <query xmlns='jabber:iq:register'>{children}</query></iq>"
        ))
    }

    fn prime(manager: &mut RegistrationManager, addr: &Address, key: &BareKey) {
        let (callback, _calls) = requirements_recorder();
        manager
            .request_requirements(addr, callback)
            .expect("first request should produce a query");
        manager.on_requirements_reply(
            key,
            &form_reply(
                "<instructions>Fill this in</instructions><key>k123</key>\
                 <username/><password/>",
            ),
        );
    }

    #[test]
    fn first_request_sends_query_and_parses_reply() {
        let mut manager = RegistrationManager::new();
        let (addr, key) = gateway();
        let (callback, calls) = requirements_recorder();

        let (id, element) = manager
            .request_requirements(&addr, callback)
            .expect("query should be produced");
        assert_eq!(element.attr("id"), Some(id.as_str()));
        assert_eq!(element.attr("to"), Some("aim.example.com"));
        assert!(element.get_child("query", ns::REGISTER).is_some());

        manager.on_requirements_reply(
            &key,
            &form_reply(
                "<instructions>Enter your screen name</instructions>\
                 <username>old_name</username><password/>",
            ),
        );

        let calls = calls.lock().expect("lock");
        let requirements = calls[0].as_ref().expect("requirements should be ok");
        assert_eq!(
            requirements.instructions.as_deref(),
            Some("Enter your screen name")
        );
        assert!(requirements.requires(RegistrationField::Username));
        assert!(requirements.requires(RegistrationField::Password));
        assert!(!requirements.requires(RegistrationField::Email));
        assert_eq!(
            requirements.fields[0].suggested.as_deref(),
            Some("old_name")
        );
    }

    #[test]
    fn cached_requirements_answer_immediately() {
        let mut manager = RegistrationManager::new();
        let (addr, key) = gateway();
        prime(&mut manager, &addr, &key);

        let (callback, calls) = requirements_recorder();
        assert!(manager.request_requirements(&addr, callback).is_none());
        assert!(calls.lock().expect("lock")[0].is_ok());
    }

    #[test]
    fn concurrent_requests_share_one_query() {
        let mut manager = RegistrationManager::new();
        let (addr, key) = gateway();

        let (first, first_calls) = requirements_recorder();
        let (second, second_calls) = requirements_recorder();
        assert!(manager.request_requirements(&addr, first).is_some());
        assert!(manager.request_requirements(&addr, second).is_none());

        manager.on_requirements_reply(&key, &form_reply("<username/>"));
        assert!(first_calls.lock().expect("lock")[0].is_ok());
        assert!(second_calls.lock().expect("lock")[0].is_ok());
    }

    #[test]
    fn requirements_error_maps_code_and_forgets_session() {
        let mut manager = RegistrationManager::new();
        let (addr, key) = gateway();
        let (callback, calls) = requirements_recorder();
        manager.request_requirements(&addr, callback);

        manager.on_requirements_reply(
            &key,
            &stanza(
                "<iq xmlns='jabber:client' type='error' id='r' from='aim.example.com'>\
                 <error code='503'/></iq>",
            ),
        );

        assert_eq!(
            calls.lock().expect("lock")[0],
            Err(StanzaError::Unavailable)
        );
        // Forgotten session means the next request starts over.
        let (retry, _retry_calls) = requirements_recorder();
        assert!(manager.request_requirements(&addr, retry).is_some());
    }

    #[test]
    fn submit_echoes_key_and_required_fields() {
        let mut manager = RegistrationManager::new();
        let (addr, key) = gateway();
        prime(&mut manager, &addr, &key);

        let values = RegistrationValues {
            username: Some("tern".to_string()),
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let (callback, calls) = submit_recorder();
        let (id, element) = manager
            .submit(&addr, &values, callback)
            .expect("submit should build a query");

        assert_eq!(element.attr("type"), Some("set"));
        assert_eq!(element.attr("id"), Some(id.as_str()));
        let query = element
            .get_child("query", ns::REGISTER)
            .expect("query child");
        assert_eq!(
            query.get_child("key", ns::REGISTER).map(Element::text),
            Some("k123".to_string())
        );
        assert_eq!(
            query.get_child("username", ns::REGISTER).map(Element::text),
            Some("tern".to_string())
        );
        assert_eq!(
            query.get_child("password", ns::REGISTER).map(Element::text),
            Some("hunter2".to_string())
        );

        manager.on_submit_reply(
            &key,
            &stanza("<iq xmlns='jabber:client' type='result' id='s' from='aim.example.com'/>"),
        );
        assert_eq!(calls.lock().expect("lock")[0], Ok(()));
    }

    #[test]
    fn submit_without_requirements_fails_fast() {
        let mut manager = RegistrationManager::new();
        let (addr, _key) = gateway();
        let (callback, _calls) = submit_recorder();

        let error = manager
            .submit(&addr, &RegistrationValues::default(), callback)
            .expect_err("must fail");
        assert!(matches!(error, RegistrationError::RequirementsUnknown(_)));
    }

    #[test]
    fn submit_with_blank_required_field_fails_fast() {
        let mut manager = RegistrationManager::new();
        let (addr, key) = gateway();
        prime(&mut manager, &addr, &key);

        let values = RegistrationValues {
            username: Some("tern".to_string()),
            ..Default::default()
        };
        let (callback, _calls) = submit_recorder();
        let error = manager
            .submit(&addr, &values, callback)
            .expect_err("must fail");
        assert_eq!(
            error,
            RegistrationError::MissingField(RegistrationField::Password)
        );
    }

    #[test]
    fn submit_error_codes_map_to_stanza_errors() {
        for (code, expected) in [
            (401, StanzaError::Unauthorized),
            (409, StanzaError::DuplicateUser),
            (404, StanzaError::Unavailable),
            (500, StanzaError::Specific(500)),
        ] {
            let mut manager = RegistrationManager::new();
            let (addr, key) = gateway();
            prime(&mut manager, &addr, &key);

            let values = RegistrationValues {
                username: Some("tern".to_string()),
                password: Some("pw".to_string()),
                ..Default::default()
            };
            let (callback, calls) = submit_recorder();
            manager
                .submit(&addr, &values, callback)
                .expect("submit should build");
            manager.on_submit_reply(
                &key,
                &stanza(&format!(
                    "<iq xmlns='jabber:client' type='error' id='s' from='aim.example.com'>\
                     <error code='{code}'/></iq>"
                )),
            );
            assert_eq!(calls.lock().expect("lock")[0], Err(expected.clone()));
        }
    }

    #[test]
    fn nickname_requirement_is_detected_and_serialized() {
        let mut manager = RegistrationManager::new();
        let (addr, key) = gateway();
        let (callback, calls) = requirements_recorder();
        manager
            .request_requirements(&addr, callback)
            .expect("query should be produced");
        manager.on_requirements_reply(&key, &form_reply("<nickname/>"));

        {
            let calls = calls.lock().expect("lock");
            let requirements = calls[0].as_ref().expect("ok");
            assert!(requirements.requires(RegistrationField::Nickname));
        }

        let values = RegistrationValues {
            nickname: Some("tern".to_string()),
            ..Default::default()
        };
        let (submit, _submit_calls) = submit_recorder();
        let (_, element) = manager
            .submit(&addr, &values, submit)
            .expect("submit should build");
        let query = element
            .get_child("query", ns::REGISTER)
            .expect("query child");
        assert_eq!(
            query.get_child("nickname", ns::REGISTER).map(Element::text),
            Some("tern".to_string())
        );
    }
}
