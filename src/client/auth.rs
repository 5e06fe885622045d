use base64::Engine;

pub enum Auth {
    /// Use an API key authentication via headers
    Apikey(String),
    /// Use username and password authentication via Basic Auth headers
    Basic(String, String),
    /// Don't use any authentication
    None,
}

impl Auth {
    /// Resolve authentication from the environment.
    ///
    /// `HARVEST_APIKEY` wins over `HARVEST_USERNAME`/`HARVEST_PASSWORD`;
    /// with neither set, requests go out unauthenticated.
    pub fn from_env() -> Self {
        if let Ok(apikey) = std::env::var("HARVEST_APIKEY") {
            Self::Apikey(apikey)
        } else if let (Ok(username), Ok(password)) = (
            std::env::var("HARVEST_USERNAME"),
            std::env::var("HARVEST_PASSWORD"),
        ) {
            Self::Basic(username, password)
        } else {
            Self::None
        }
    }

    /// Value for the `Authorization` header, if any.
    pub fn header_value(&self) -> Option<String> {
        match self {
            Self::Apikey(apikey) => Some(format!("Bearer {}", apikey)),
            Self::Basic(username, password) => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                Some(format!("Basic {}", credentials))
            }
            Self::None => None,
        }
    }
}

impl std::fmt::Display for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apikey(_) => write!(f, "Apikey"),
            Self::Basic(_, _) => write!(f, "Basic"),
            Self::None => write!(f, "None"),
        }
    }
}
