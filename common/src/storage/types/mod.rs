use serde::{Deserialize, Serialize};

pub mod connector_event;
pub mod content_blob;
pub mod document;
pub mod embedding;
pub mod embedding_batch_job;
pub mod embedding_queue;
pub mod service_credentials;
pub mod source;
pub mod sync_run;

pub trait StoredObject: Serialize + for<'de> Deserialize<'de> {
    fn table_name() -> &'static str;
    fn get_id(&self) -> &str;
}

/// Define a SurrealDB-backed record: `id`, `created_at` and `updated_at` plus
/// the listed fields, with `StoredObject` wired up.
///
/// SurrealDB hands record ids back as `Thing`s but accepts plain strings, and
/// its datetimes round-trip through `surrealdb::sql::Datetime`; the generated
/// serde helpers absorb both so the rest of the codebase only ever sees
/// `String` ids and `chrono` timestamps. Invoke once per module.
#[macro_export]
macro_rules! stored_object {
    ($name:ident, $table:expr, {$($(#[$attr:meta])* $field:ident: $ty:ty),* $(,)?}) => {
        use serde::{Deserialize, Deserializer, Serialize};
        use serde::de::{self, Visitor};
        use std::fmt;
        use surrealdb::sql::Thing;
        use chrono::{DateTime, Utc};
        use $crate::storage::types::StoredObject;

        struct RecordIdVisitor;

        impl<'de> Visitor<'de> for RecordIdVisitor {
            type Value = String;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string or a Thing")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(value.to_string())
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(value)
            }

            fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let thing = Thing::deserialize(de::value::MapAccessDeserializer::new(map))?;
                Ok(thing.id.to_raw())
            }
        }

        pub fn deserialize_record_id<'de, D>(deserializer: D) -> Result<String, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(RecordIdVisitor)
        }

        fn serialize_datetime<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            Into::<surrealdb::sql::Datetime>::into(*date).serialize(serializer)
        }

        fn deserialize_datetime<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            let dt = surrealdb::sql::Datetime::deserialize(deserializer)?;
            Ok(DateTime::<Utc>::from(dt))
        }

        #[allow(dead_code)]
        fn serialize_option_datetime<S>(
            date: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            match date {
                Some(dt) => {
                    serializer.serialize_some(&Into::<surrealdb::sql::Datetime>::into(*dt))
                }
                None => serializer.serialize_none(),
            }
        }

        #[allow(dead_code)]
        fn deserialize_option_datetime<'de, D>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            let value = Option::<surrealdb::sql::Datetime>::deserialize(deserializer)?;
            Ok(value.map(DateTime::<Utc>::from))
        }

        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        pub struct $name {
            #[serde(deserialize_with = "deserialize_record_id")]
            pub id: String,
            #[serde(
                serialize_with = "serialize_datetime",
                deserialize_with = "deserialize_datetime",
                default
            )]
            pub created_at: DateTime<Utc>,
            #[serde(
                serialize_with = "serialize_datetime",
                deserialize_with = "deserialize_datetime",
                default
            )]
            pub updated_at: DateTime<Utc>,
            $( $(#[$attr])* pub $field: $ty),*
        }

        impl StoredObject for $name {
            fn table_name() -> &'static str {
                $table
            }

            fn get_id(&self) -> &str {
                &self.id
            }
        }
    };
}
