// src/models/ids.rs
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::id_generator::{IdGenerator, IdType};

macro_rules! typed_id {
    ($name:ident, $id_type:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(IdGenerator::generate($id_type))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_well_formed(&self) -> bool {
                IdGenerator::validate_id(&self.0, Some($id_type))
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(RideId, IdType::Ride);
typed_id!(DriverId, IdType::Driver);
typed_id!(UserId, IdType::User);
typed_id!(ReviewId, IdType::Review);

/// Either side of a trip, as a rated or rating party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PartyRef {
    Passenger(UserId),
    Driver(DriverId),
}

impl PartyRef {
    pub fn key_fragment(&self) -> String {
        match self {
            PartyRef::Passenger(id) => format!("user:{}", id),
            PartyRef::Driver(id) => format!("driver:{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_their_prefix() {
        assert!(RideId::generate().as_str().starts_with("rid-"));
        assert!(DriverId::generate().is_well_formed());
        assert!(!DriverId::from("usr-231207-a1b2c").is_well_formed());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = UserId::from("usr-231207-a1b2c");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"usr-231207-a1b2c\"");
    }

    #[test]
    fn party_ref_wire_shape() {
        let party = PartyRef::Driver(DriverId::from("drv-231207-a1b2c"));
        let json = serde_json::to_value(&party).unwrap();
        assert_eq!(json["kind"], "driver");
        assert_eq!(json["id"], "drv-231207-a1b2c");
    }
}
