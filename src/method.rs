use std::{fmt, str::FromStr};

/// HTTP Method.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Method(Inner);

// https://tools.ietf.org/html/rfc7231#section-4
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
enum Inner {
    Options,
    #[default]
    Get,
    Head,
    Trace,
    Connect,
    Post,
    Put,
    Delete,
    Patch,
}

macro_rules! methods {
    (
        $(
            $(#[$doc:meta])*
            $id:ident: $var:ident = $bytes:literal;
        )*
    ) => {
        impl Method {
            $(
                $(#[$doc])*
                pub const $id: Self = Self(Inner::$var);
            )*

            /// Returns the method token, e.g: `"GET"`.
            pub const fn as_str(&self) -> &'static str {
                match self.0 {
                    $(Inner::$var => unsafe {
                        // SAFETY: method tokens are ASCII literals
                        str::from_utf8_unchecked($bytes)
                    },)*
                }
            }

            /// Parse a method from its token bytes.
            pub const fn from_bytes(bytes: &[u8]) -> Option<Self> {
                match bytes {
                    $($bytes => Some(Self(Inner::$var)),)*
                    _ => None,
                }
            }
        }
    };
}

methods! {
    /// The `OPTIONS` method describes the communication options for the target resource.
    OPTIONS: Options = b"OPTIONS";
    /// The `GET` method requests a representation of the specified resource.
    GET: Get = b"GET";
    /// The `HEAD` method asks for a response identical to a GET request, but without a
    /// response body.
    HEAD: Head = b"HEAD";
    /// The `TRACE` method performs a message loop-back test along the path to the target
    /// resource.
    TRACE: Trace = b"TRACE";
    /// The `CONNECT` method establishes a tunnel to the server identified by the target
    /// resource.
    CONNECT: Connect = b"CONNECT";
    /// The `POST` method submits an entity to the specified resource.
    POST: Post = b"POST";
    /// The `PUT` method replaces all current representations of the target resource with
    /// the request content.
    PUT: Put = b"PUT";
    /// The `DELETE` method deletes the specified resource.
    DELETE: Delete = b"DELETE";
    /// The `PATCH` method applies partial modifications to a resource.
    PATCH: Patch = b"PATCH";
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ===== Error =====

/// An error when trying to parse [`Method`] from a string.
#[derive(Debug)]
pub struct UnknownMethod;

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes()).ok_or(UnknownMethod)
    }
}

impl std::error::Error for UnknownMethod {}

impl fmt::Display for UnknownMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown http method")
    }
}
