use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("malformed address: {0}")]
    Malformed(String),
}

/// A parsed XMPP address (JID): `node@domain/resource`, with node and
/// resource optional.
///
/// Node and domain are ASCII case-folded at parse time so that bare-address
/// comparison is case-insensitive; the resource keeps its original case and
/// compares case-sensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Address {
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AddressError::Malformed("empty address".to_string()));
        }

        // The resource starts after the last unescaped slash; everything a
        // chatroom hands out as an occupant nick lives there verbatim.
        let (bare, resource) = match last_unescaped_slash(text) {
            Some(idx) => {
                let resource = &text[idx + 1..];
                if resource.is_empty() {
                    return Err(AddressError::Malformed(format!(
                        "empty resource in {text:?}"
                    )));
                }
                (&text[..idx], Some(resource.to_string()))
            }
            None => (text, None),
        };

        let (node, domain) = match bare.split_once('@') {
            Some((node, domain)) => {
                if node.is_empty() {
                    return Err(AddressError::Malformed(format!("empty node in {text:?}")));
                }
                (Some(node.to_ascii_lowercase()), domain)
            }
            None => (None, bare),
        };

        if domain.is_empty() || domain.contains('@') {
            return Err(AddressError::Malformed(format!("bad domain in {text:?}")));
        }

        Ok(Self {
            node,
            domain: domain.to_ascii_lowercase(),
            resource,
        })
    }

    /// Positional sanity check on a raw address string, used for form input
    /// before an `Address` is ever constructed. Checks that the `@` exists
    /// and is not first or last, that a dot after the `@` is neither glued to
    /// it nor (second-)last, and that a slash is present exactly when a
    /// resource is required.
    pub fn validate(text: &str, require_resource: bool) -> bool {
        let bytes = text.as_bytes();
        let Some(at) = text.find('@') else {
            return false;
        };
        if at == 0 || at + 1 == bytes.len() {
            return false;
        }

        if let Some(dot) = text[at..].find('.').map(|i| at + i) {
            if dot == at + 1 || dot + 1 >= bytes.len() || dot + 2 >= bytes.len() {
                return false;
            }
        }

        match text[at..].find('/').map(|i| at + i) {
            Some(slash) => require_resource && slash + 1 < bytes.len(),
            None => !require_resource,
        }
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The `node@domain` form without any resource.
    pub fn to_bare(&self) -> String {
        match &self.node {
            Some(node) => format!("{}@{}", node, self.domain),
            None => self.domain.clone(),
        }
    }

    /// The full form including the resource when one is set.
    pub fn to_full(&self) -> String {
        match &self.resource {
            Some(resource) => format!("{}/{}", self.to_bare(), resource),
            None => self.to_bare(),
        }
    }

    pub fn bare(&self) -> Address {
        Address {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Replace the resource, leaving the bare part untouched.
    pub fn set_resource(&mut self, resource: Option<&str>) {
        self.resource = resource
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);
    }

    /// Replace the bare part from a raw string, keeping the current resource
    /// unless the new text carries one of its own.
    pub fn set_bare(&mut self, text: &str) -> Result<(), AddressError> {
        let parsed = Address::parse(text)?;
        self.node = parsed.node;
        self.domain = parsed.domain;
        if parsed.resource.is_some() {
            self.resource = parsed.resource;
        }
        Ok(())
    }

    /// Case-insensitive comparison of the bare parts only.
    pub fn equal_bare(&self, other: &Address) -> bool {
        self.node == other.node && self.domain == other.domain
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_full())
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

/// Map key identifying an address by its folded bare form. Two full
/// addresses with different resources collapse to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BareKey(String);

impl BareKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Address> for BareKey {
    fn from(addr: &Address) -> Self {
        BareKey(addr.to_bare())
    }
}

impl std::fmt::Display for BareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn last_unescaped_slash(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut found = None;
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' => idx += 1, // skip the escaped byte
            b'/' => found = Some(idx),
            _ => {}
        }
        idx += 1;
    }
    found
}
