use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use minidom::Element;
use tracing::{debug, warn};

use crate::addr::Address;
use crate::error::StanzaError;
use crate::stanza::{iq_get, iq_set, new_id, ns, Stanza};

/// Mime type assumed for avatars published without one.
pub const DEFAULT_AVATAR_TYPE: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// The profile fields the engine reads from and writes to a vcard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub birthday: Option<String>,
    pub email: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<Avatar>,
}

pub type FetchCallback = Box<dyn FnOnce(Result<Profile, StanzaError>) + Send>;
pub type UpdateCallback = Box<dyn FnOnce(Result<(), StanzaError>) + Send>;

enum PendingVcard {
    Get(FetchCallback),
    Set(UpdateCallback),
}

/// Outstanding vcard conversations keyed by iq id.
#[derive(Default)]
pub struct VcardManager {
    pending: HashMap<String, PendingVcard>,
}

impl VcardManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a profile. `target` of `None` asks the server for our own vcard.
    pub fn get(&mut self, target: Option<&Address>, callback: FetchCallback) -> (String, Element) {
        let id = new_id();
        self.pending.insert(id.clone(), PendingVcard::Get(callback));
        let vcard = Element::builder("vCard", ns::VCARD).build();
        (id.clone(), iq_get(&id, target.map(Address::bare).as_ref(), vcard))
    }

    /// Publish our own profile.
    pub fn set(&mut self, profile: &Profile, callback: UpdateCallback) -> (String, Element) {
        let id = new_id();
        self.pending.insert(id.clone(), PendingVcard::Set(callback));
        (id.clone(), iq_set(&id, None, vcard_element(profile)))
    }

    /// Handle the reply to a fetch.
    pub fn on_get_reply(&mut self, id: &str, stanza: &Stanza) {
        let Some(PendingVcard::Get(callback)) = self.pending.remove(id) else {
            return;
        };

        if stanza.has_error() {
            callback(Err(map_vcard_error(stanza.error_code())));
            return;
        }

        // A success reply must carry the vcard node, even for users who
        // never published one.
        let Some(vcard) = stanza.payload("vCard", ns::VCARD) else {
            warn!("vcard result carried no vCard node");
            callback(Err(StanzaError::InvalidReply));
            return;
        };
        callback(Ok(parse_vcard(vcard)));
    }

    /// Handle the reply to a publish. Returns whether it succeeded, so the
    /// session can rebroadcast presence and make clients refresh the vcard.
    pub fn on_set_reply(&mut self, id: &str, stanza: &Stanza) -> bool {
        let Some(PendingVcard::Set(callback)) = self.pending.remove(id) else {
            return false;
        };

        if stanza.has_error() {
            warn!(code = ?stanza.error_code(), "vcard publish rejected");
            callback(Err(map_vcard_error(stanza.error_code())));
            false
        } else {
            debug!("vcard publish accepted");
            callback(Ok(()));
            true
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn map_vcard_error(code: Option<u16>) -> StanzaError {
    match code {
        Some(404) | Some(503) => StanzaError::Unavailable,
        _ => StanzaError::InvalidReply,
    }
}

fn child_text(vcard: &Element, name: &str) -> Option<String> {
    vcard
        .get_child(name, ns::VCARD)
        .map(Element::text)
        .filter(|text| !text.is_empty())
}

fn parse_vcard(vcard: &Element) -> Profile {
    let email = vcard.get_child("EMAIL", ns::VCARD).and_then(|email| {
        // Modern vcards nest the address under USERID; ancient ones put it
        // straight in EMAIL.
        let text = email
            .get_child("USERID", ns::VCARD)
            .map(Element::text)
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| email.text());
        Some(text).filter(|text| text.contains('@'))
    });

    let avatar = vcard.get_child("PHOTO", ns::VCARD).and_then(|photo| {
        let encoded: String = photo
            .get_child("BINVAL", ns::VCARD)
            .map(Element::text)?
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if encoded.is_empty() {
            return None;
        }
        let data = match BASE64.decode(&encoded) {
            Ok(data) => data,
            Err(error) => {
                warn!(%error, "discarding avatar with undecodable payload");
                return None;
            }
        };
        let mime_type = photo
            .get_child("TYPE", ns::VCARD)
            .map(Element::text)
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| DEFAULT_AVATAR_TYPE.to_string());
        Some(Avatar { mime_type, data })
    });

    Profile {
        name: child_text(vcard, "FN"),
        nickname: child_text(vcard, "NICKNAME"),
        birthday: child_text(vcard, "BDAY"),
        email,
        url: child_text(vcard, "URL"),
        description: child_text(vcard, "DESC"),
        avatar,
    }
}

fn append_text(vcard: &mut Element, name: &str, value: &Option<String>) {
    if let Some(value) = value {
        vcard.append_child(
            Element::builder(name, ns::VCARD)
                .append(value.as_str())
                .build(),
        );
    }
}

fn vcard_element(profile: &Profile) -> Element {
    let mut vcard = Element::builder("vCard", ns::VCARD).build();
    append_text(&mut vcard, "FN", &profile.name);
    append_text(&mut vcard, "NICKNAME", &profile.nickname);
    append_text(&mut vcard, "BDAY", &profile.birthday);
    append_text(&mut vcard, "URL", &profile.url);
    append_text(&mut vcard, "DESC", &profile.description);

    if let Some(email) = &profile.email {
        vcard.append_child(
            Element::builder("EMAIL", ns::VCARD)
                .append(
                    Element::builder("USERID", ns::VCARD)
                        .append(email.as_str())
                        .build(),
                )
                .build(),
        );
    }

    if let Some(avatar) = &profile.avatar {
        vcard.append_child(
            Element::builder("PHOTO", ns::VCARD)
                .append(
                    Element::builder("TYPE", ns::VCARD)
                        .append(avatar.mime_type.as_str())
                        .build(),
                )
                .append(
                    Element::builder("BINVAL", ns::VCARD)
                        .append(BASE64.encode(&avatar.data))
                        .build(),
                )
                .build(),
        );
    }

    vcard
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn stanza(xml: &str) -> Stanza {
        Stanza::parse(xml.as_bytes()).expect("stanza should parse")
    }

    fn fetch_recorder() -> (FetchCallback, Arc<Mutex<Vec<Result<Profile, StanzaError>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let inner = calls.clone();
        let callback = Box::new(move |result| {
            inner.lock().expect("lock").push(result);
        });
        (callback, calls)
    }

    fn update_recorder() -> (UpdateCallback, Arc<Mutex<Vec<Result<(), StanzaError>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let inner = calls.clone();
        let callback = Box::new(move |result| {
            inner.lock().expect("lock").push(result);
        });
        (callback, calls)
    }

    fn result_with_vcard(id: &str, children: &str) -> Stanza {
        stanza(&format!(
            "<iq xmlns='jabber:client' type='result' id='{id}'>\
             <vCard xmlns='vcard-temp'>{children}</vCard></iq>"
        ))
    }

    #[test]
    fn get_targets_bare_address() {
        let mut manager = VcardManager::new();
        let target = Address::parse("alice@example.com/home").expect("parse");
        let (callback, _calls) = fetch_recorder();

        let (id, element) = manager.get(Some(&target), callback);
        assert_eq!(element.attr("id"), Some(id.as_str()));
        assert_eq!(element.attr("to"), Some("alice@example.com"));
        assert!(element.get_child("vCard", ns::VCARD).is_some());
    }

    #[test]
    fn own_vcard_get_has_no_target() {
        let mut manager = VcardManager::new();
        let (callback, _calls) = fetch_recorder();
        let (_, element) = manager.get(None, callback);
        assert_eq!(element.attr("to"), None);
    }

    #[test]
    fn reply_parses_all_profile_fields() {
        let mut manager = VcardManager::new();
        let (callback, calls) = fetch_recorder();
        let (id, _) = manager.get(None, callback);

        manager.on_get_reply(
            &id,
            &result_with_vcard(
                &id,
                "<FN>Arctic Tern</FN><NICKNAME>tern</NICKNAME><BDAY>1990-05-01</BDAY>\
                 <EMAIL><USERID>tern@example.com</USERID></EMAIL>\
                 <URL>https://example.com</URL><DESC>long-distance flyer</DESC>",
            ),
        );

        let calls = calls.lock().expect("lock");
        let profile = calls[0].as_ref().expect("profile should be ok");
        assert_eq!(profile.name.as_deref(), Some("Arctic Tern"));
        assert_eq!(profile.nickname.as_deref(), Some("tern"));
        assert_eq!(profile.birthday.as_deref(), Some("1990-05-01"));
        assert_eq!(profile.email.as_deref(), Some("tern@example.com"));
        assert_eq!(profile.url.as_deref(), Some("https://example.com"));
        assert_eq!(profile.description.as_deref(), Some("long-distance flyer"));
        assert!(profile.avatar.is_none());
    }

    #[test]
    fn legacy_direct_email_text_is_accepted() {
        let mut manager = VcardManager::new();
        let (callback, calls) = fetch_recorder();
        let (id, _) = manager.get(None, callback);

        manager.on_get_reply(&id, &result_with_vcard(&id, "<EMAIL>old@example.com</EMAIL>"));
        let calls = calls.lock().expect("lock");
        let profile = calls[0].as_ref().expect("ok");
        assert_eq!(profile.email.as_deref(), Some("old@example.com"));
    }

    #[test]
    fn email_without_at_sign_is_dropped() {
        let mut manager = VcardManager::new();
        let (callback, calls) = fetch_recorder();
        let (id, _) = manager.get(None, callback);

        manager.on_get_reply(&id, &result_with_vcard(&id, "<EMAIL>not-an-address</EMAIL>"));
        assert!(calls.lock().expect("lock")[0]
            .as_ref()
            .expect("ok")
            .email
            .is_none());
    }

    #[test]
    fn avatar_decodes_wrapped_base64_and_defaults_type() {
        let mut manager = VcardManager::new();
        let (callback, calls) = fetch_recorder();
        let (id, _) = manager.get(None, callback);

        // "hello" base64-encoded, split the way servers wrap long BINVALs.
        manager.on_get_reply(
            &id,
            &result_with_vcard(&id, "<PHOTO><BINVAL>aGVs\n  bG8=</BINVAL></PHOTO>"),
        );

        let calls = calls.lock().expect("lock");
        let avatar = calls[0]
            .as_ref()
            .expect("ok")
            .avatar
            .as_ref()
            .expect("avatar should decode");
        assert_eq!(avatar.data, b"hello");
        assert_eq!(avatar.mime_type, DEFAULT_AVATAR_TYPE);
    }

    #[test]
    fn undecodable_avatar_is_dropped_not_fatal() {
        let mut manager = VcardManager::new();
        let (callback, calls) = fetch_recorder();
        let (id, _) = manager.get(None, callback);

        manager.on_get_reply(
            &id,
            &result_with_vcard(&id, "<FN>A</FN><PHOTO><BINVAL>!!!</BINVAL></PHOTO>"),
        );
        let calls = calls.lock().expect("lock");
        let profile = calls[0].as_ref().expect("ok");
        assert_eq!(profile.name.as_deref(), Some("A"));
        assert!(profile.avatar.is_none());
    }

    #[test]
    fn result_without_vcard_node_is_invalid() {
        let mut manager = VcardManager::new();
        let (callback, calls) = fetch_recorder();
        let (id, _) = manager.get(None, callback);

        manager.on_get_reply(
            &id,
            &stanza(&format!("<iq xmlns='jabber:client' type='result' id='{id}'/>")),
        );
        assert_eq!(
            *calls.lock().expect("lock"),
            [Err(StanzaError::InvalidReply)]
        );
    }

    #[test]
    fn empty_vcard_node_is_an_empty_profile() {
        let mut manager = VcardManager::new();
        let (callback, calls) = fetch_recorder();
        let (id, _) = manager.get(None, callback);

        manager.on_get_reply(&id, &result_with_vcard(&id, ""));
        assert_eq!(*calls.lock().expect("lock"), [Ok(Profile::default())]);
    }

    #[test]
    fn error_codes_map_for_fetch() {
        for (code, expected) in [
            (404, StanzaError::Unavailable),
            (503, StanzaError::Unavailable),
            (500, StanzaError::InvalidReply),
        ] {
            let mut manager = VcardManager::new();
            let (callback, calls) = fetch_recorder();
            let (id, _) = manager.get(None, callback);

            manager.on_get_reply(
                &id,
                &stanza(&format!(
                    "<iq xmlns='jabber:client' type='error' id='{id}'>\
                     <error code='{code}'/></iq>"
                )),
            );
            assert_eq!(*calls.lock().expect("lock"), [Err(expected.clone())]);
        }
    }

    #[test]
    fn set_serializes_profile_and_reports_success() {
        let mut manager = VcardManager::new();
        let profile = Profile {
            name: Some("Arctic Tern".to_string()),
            email: Some("tern@example.com".to_string()),
            avatar: Some(Avatar {
                mime_type: "image/png".to_string(),
                data: b"hello".to_vec(),
            }),
            ..Default::default()
        };
        let (callback, calls) = update_recorder();
        let (id, element) = manager.set(&profile, callback);

        assert_eq!(element.attr("type"), Some("set"));
        let vcard = element.get_child("vCard", ns::VCARD).expect("vCard child");
        assert_eq!(
            vcard.get_child("FN", ns::VCARD).map(Element::text),
            Some("Arctic Tern".to_string())
        );
        let email = vcard.get_child("EMAIL", ns::VCARD).expect("EMAIL child");
        assert_eq!(
            email.get_child("USERID", ns::VCARD).map(Element::text),
            Some("tern@example.com".to_string())
        );
        let photo = vcard.get_child("PHOTO", ns::VCARD).expect("PHOTO child");
        assert_eq!(
            photo.get_child("BINVAL", ns::VCARD).map(Element::text),
            Some("aGVsbG8=".to_string())
        );

        let rebroadcast = manager.on_set_reply(
            &id,
            &stanza(&format!("<iq xmlns='jabber:client' type='result' id='{id}'/>")),
        );
        assert!(rebroadcast);
        assert_eq!(*calls.lock().expect("lock"), [Ok(())]);
        assert!(manager.is_empty());
    }

    #[test]
    fn failed_set_does_not_ask_for_rebroadcast() {
        let mut manager = VcardManager::new();
        let (callback, calls) = update_recorder();
        let (id, _) = manager.set(&Profile::default(), callback);

        let rebroadcast = manager.on_set_reply(
            &id,
            &stanza(&format!(
                "<iq xmlns='jabber:client' type='error' id='{id}'>\
                 <error code='503'/></iq>"
            )),
        );
        assert!(!rebroadcast);
        assert_eq!(
            *calls.lock().expect("lock"),
            [Err(StanzaError::Unavailable)]
        );
    }

    #[test]
    fn absent_fields_are_not_serialized() {
        let vcard = vcard_element(&Profile::default());
        assert!(vcard.children().next().is_none());
    }

    #[test]
    fn reply_with_unknown_id_is_ignored() {
        let mut manager = VcardManager::new();
        manager.on_get_reply(
            "nope",
            &stanza("<iq xmlns='jabber:client' type='result' id='nope'/>"),
        );
        assert!(!manager.on_set_reply(
            "nope",
            &stanza("<iq xmlns='jabber:client' type='result' id='nope'/>"),
        ));
    }
}
