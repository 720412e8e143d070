pub mod num_as_str {
    use std::{fmt::Display, str::FromStr};

    use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: ToString,
    {
        value.to_string().serialize(serializer)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

/// (De)serializes a Unix timestamp in seconds as an RFC 3339 date, e.g. `2024-05-01T12:00:00Z`.
pub mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de, ser};
    use time::{OffsetDateTime, format_description::well_known::Rfc3339};

    pub fn serialize<S>(secs: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = i64::try_from(*secs).map_err(ser::Error::custom)?;
        OffsetDateTime::from_unix_timestamp(secs)
            .map_err(ser::Error::custom)?
            .format(&Rfc3339)
            .map_err(ser::Error::custom)?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let date = OffsetDateTime::parse(&s, &Rfc3339).map_err(de::Error::custom)?;
        u64::try_from(date.unix_timestamp()).map_err(de::Error::custom)
    }
}
