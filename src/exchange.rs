use serde::{Deserialize, Serialize};

/// The type of an exchange, as given to `exchange_declare`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Custom(String),
    Direct,
    Fanout,
    Headers,
    Topic,
}

impl ExchangeKind {
    pub(crate) fn kind(&self) -> &str {
        match self {
            ExchangeKind::Custom(kind) => kind.as_str(),
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Topic => "topic",
        }
    }
}

impl Default for ExchangeKind {
    fn default() -> Self {
        ExchangeKind::Direct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_form_matches_the_wire_types() {
        assert_eq!(serde_json::to_string(&ExchangeKind::Topic).unwrap(), "\"topic\"");
        assert_eq!(
            serde_json::from_str::<ExchangeKind>("\"fanout\"").unwrap(),
            ExchangeKind::Fanout
        );
    }
}
