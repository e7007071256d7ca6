//! Sample producers for job tests

#![allow(dead_code)]

use carrier_verify::models::subject::Subject;

/// A producer fixture with a short description for test output.
#[derive(Debug, Clone)]
pub struct SubjectFixture {
    pub first_name: &'static str,
    pub last_name: &'static str,
    pub npn: &'static str,
    pub resident_state: &'static str,
    pub date_of_birth: &'static str,
    pub description: &'static str,
}

impl SubjectFixture {
    pub fn subject(&self) -> Subject {
        Subject {
            first_name: self.first_name.to_string(),
            last_name: self.last_name.to_string(),
            npn: self.npn.to_string(),
            resident_state: self.resident_state.to_string(),
            date_of_birth: self.date_of_birth.to_string(),
        }
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::to_value(self.subject()).expect("subject serializes")
    }
}

pub const SUBJECTS: &[SubjectFixture] = &[
    SubjectFixture {
        first_name: "Dana",
        last_name: "Whitfield",
        npn: "17654321",
        resident_state: "TX",
        date_of_birth: "1984-03-09",
        description: "Texas producer, two carrier appointments",
    },
    SubjectFixture {
        first_name: "Marcus",
        last_name: "Oyelaran",
        npn: "20931877",
        resident_state: "GA",
        date_of_birth: "1979-11-22",
        description: "Georgia producer",
    },
    SubjectFixture {
        first_name: "Priya",
        last_name: "Venkataraman",
        npn: "8812004",
        resident_state: "NJ",
        date_of_birth: "1991-06-30",
        description: "New Jersey producer, seven-digit NPN",
    },
    SubjectFixture {
        first_name: "Lena",
        last_name: "Kowalczyk",
        npn: "31100458",
        resident_state: "IL",
        date_of_birth: "1968-01-14",
        description: "Illinois producer",
    },
];

pub fn subject_a() -> Subject {
    SUBJECTS[0].subject()
}

pub const EXPECTED_CARRIERS: &[&str] = &["Aetna", "Foresters"];
