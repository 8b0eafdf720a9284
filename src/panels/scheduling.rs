//! Appointment scheduling.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::fuzzy::{CommandAction, CommandGroup};
use super::{FieldSetter, Vertical, VerticalKind};
use crate::error::PanelError;
use crate::storage::{Collection, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    #[default]
    Pending,
    Scheduled,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(AppointmentStatus::Pending),
            "scheduled" => Some(AppointmentStatus::Scheduled),
            "cancelled" => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentDraft {
    pub patient_name: String,
    pub mrn: String,
    pub date: String,
    pub time: String,
    pub provider: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub patient_name: String,
    pub mrn: String,
    pub date: String,
    pub time: String,
    pub provider: String,
    pub reason: String,
    #[serde(default)]
    pub status: AppointmentStatus,
}

impl Record for Appointment {
    const COLLECTION: Collection = Collection::Appointments;

    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn status(&self) -> Option<&'static str> {
        Some(self.status.as_str())
    }
}

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];
const TIME_FORMATS: [&str; 3] = ["%H:%M", "%H:%M:%S", "%I:%M %p"];

/// When the appointment takes place, or `None` if date or time do not parse.
pub fn appointment_time(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let date = DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(date.trim(), f).ok())?;
    let time = TIME_FORMATS
        .iter()
        .find_map(|f| NaiveTime::parse_from_str(time.trim(), f).ok())?;
    Utc.from_local_datetime(&date.and_time(time)).single()
}

static SETTERS: [FieldSetter<AppointmentDraft>; 6] = [
    FieldSetter {
        function: "set_patient_name",
        field: "patientName",
        arg: "name",
        description: "The patient's full name",
        apply: |d: &mut AppointmentDraft, v: String| d.patient_name = v,
    },
    FieldSetter {
        function: "set_mrn",
        field: "mrn",
        arg: "mrn",
        description: "The patient's Medical Record Number",
        apply: |d: &mut AppointmentDraft, v: String| d.mrn = v,
    },
    FieldSetter {
        function: "set_date",
        field: "date",
        arg: "date",
        description: "The appointment date in YYYY-MM-DD format",
        apply: |d: &mut AppointmentDraft, v: String| d.date = v,
    },
    FieldSetter {
        function: "set_time",
        field: "time",
        arg: "time",
        description: "The appointment time in 24-hour HH:MM format",
        apply: |d: &mut AppointmentDraft, v: String| d.time = v,
    },
    FieldSetter {
        function: "set_provider",
        field: "provider",
        arg: "provider",
        description: "The healthcare provider for the appointment",
        apply: |d: &mut AppointmentDraft, v: String| d.provider = v,
    },
    FieldSetter {
        function: "set_reason",
        field: "reason",
        arg: "reason",
        description: "The reason for the appointment",
        apply: |d: &mut AppointmentDraft, v: String| d.reason = v,
    },
];

static COMMANDS: [CommandGroup; 2] = [
    CommandGroup {
        action: CommandAction::Start,
        phrases: &["start scheduling", "scheduling"],
    },
    CommandGroup {
        action: CommandAction::Cancel,
        phrases: &["cancel scheduling"],
    },
];

pub struct Scheduling;

impl Vertical for Scheduling {
    type Draft = AppointmentDraft;
    type Record = Appointment;

    const KIND: VerticalKind = VerticalKind::Scheduling;
    const SAVE_FUNCTION: &'static str = "schedule_appointment";
    const SAVE_DESCRIPTION: &'static str = "Schedule the appointment";
    const CLEAR_FUNCTION: &'static str = "clear_appointment";
    const CLEAR_DESCRIPTION: &'static str = "Clear the current appointment";
    const PROMPT: &'static str = "You are a scheduling assistant booking patient appointments. \
Do not ask for any information until the user says \"Scheduling\" or \"Start Scheduling\". \
When starting, say only \"What is the patient's name?\". Ask for one field at a time, in this order: \
patient name, medical record number, date, time, provider, reason for the appointment. \
Call the matching set_ function as soon as you hear a value, then ask only for the next missing field. \
Pass dates as YYYY-MM-DD and times as 24-hour HH:MM, resolving words like tomorrow against today's date. \
Read the appointment back once every field is filled and ask the user to confirm. \
When the user confirms, call schedule_appointment. \
When you hear \"Cancel Scheduling\" or \"Clear appointment\" call clear_appointment.";

    fn setters() -> &'static [FieldSetter<AppointmentDraft>] {
        &SETTERS
    }

    fn commands() -> &'static [CommandGroup] {
        &COMMANDS
    }

    fn finalize(draft: &AppointmentDraft, now: DateTime<Utc>) -> Result<Appointment, PanelError> {
        let missing: Vec<&str> = [
            ("patient name", &draft.patient_name),
            ("MRN", &draft.mrn),
            ("date", &draft.date),
            ("time", &draft.time),
            ("provider", &draft.provider),
            ("reason", &draft.reason),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(label, _)| label)
        .collect();
        if !missing.is_empty() {
            return Err(PanelError::Incomplete(missing.join(", ")));
        }

        let timestamp = appointment_time(&draft.date, &draft.time).unwrap_or_else(|| {
            log::warn!(
                "Unparseable appointment time {:?} {:?}, using the current time",
                draft.date,
                draft.time
            );
            now
        });
        Ok(Appointment {
            id: Uuid::new_v4().to_string(),
            timestamp,
            patient_name: draft.patient_name.clone(),
            mrn: draft.mrn.clone(),
            date: draft.date.clone(),
            time: draft.time.clone(),
            provider: draft.provider.clone(),
            reason: draft.reason.clone(),
            status: AppointmentStatus::Scheduled,
        })
    }

    fn fixture() -> Appointment {
        Appointment {
            id: "default-appointment".into(),
            timestamp: appointment_time("2025-02-21", "17:40").unwrap_or_default(),
            patient_name: "Jim Bloggs".into(),
            mrn: "C654821".into(),
            date: "2025-02-21".into(),
            time: "17:40".into(),
            provider: "Dr. Smith".into(),
            reason: "Follow-up consultation".into(),
            status: AppointmentStatus::Scheduled,
        }
    }

    fn set_status(record: &mut Appointment, status: &str) -> Result<(), PanelError> {
        record.status = AppointmentStatus::parse(status)
            .ok_or_else(|| PanelError::InvalidStatus(status.to_string()))?;
        Ok(())
    }

    fn toggled_status(record: &Appointment) -> Option<&'static str> {
        let next = match record.status {
            AppointmentStatus::Scheduled => AppointmentStatus::Cancelled,
            AppointmentStatus::Cancelled | AppointmentStatus::Pending => {
                AppointmentStatus::Scheduled
            }
        };
        Some(next.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panels::{seed_defaults, PanelHandle, Phase, VerticalPanel};
    use crate::storage::RecordStore;

    fn filled() -> AppointmentDraft {
        AppointmentDraft {
            patient_name: "Jim Bloggs".into(),
            mrn: "C654821".into(),
            date: "2025-03-04".into(),
            time: "09:15".into(),
            provider: "Dr. Patel".into(),
            reason: "Blood test".into(),
        }
    }

    #[test]
    fn timestamp_comes_from_date_and_time() {
        let appointment = Scheduling::finalize(&filled(), Utc::now()).unwrap();
        assert_eq!(
            appointment.timestamp,
            Utc.with_ymd_and_hms(2025, 3, 4, 9, 15, 0).unwrap()
        );
        assert_eq!(appointment.status, AppointmentStatus::Scheduled);
    }

    #[test]
    fn spoken_time_formats_parse() {
        assert_eq!(
            appointment_time("03/04/2025", "2:30 PM"),
            Utc.with_ymd_and_hms(2025, 3, 4, 14, 30, 0).single()
        );
        assert_eq!(appointment_time("next tuesday", "09:00"), None);
    }

    #[test]
    fn unparseable_time_falls_back_to_now() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let mut draft = filled();
        draft.time = "after lunch".into();
        assert_eq!(Scheduling::finalize(&draft, now).unwrap().timestamp, now);
    }

    #[test]
    fn every_field_is_required() {
        let mut draft = filled();
        draft.mrn.clear();
        draft.reason.clear();
        let err = Scheduling::finalize(&draft, Utc::now()).unwrap_err();
        assert!(matches!(err, PanelError::Incomplete(ref what) if what == "MRN, reason"));
    }

    #[test]
    fn toggle_cycles_between_scheduled_and_cancelled() {
        let mut appointment = Scheduling::fixture();
        assert_eq!(Scheduling::toggled_status(&appointment), Some("cancelled"));
        appointment.status = AppointmentStatus::Pending;
        assert_eq!(Scheduling::toggled_status(&appointment), Some("scheduled"));
    }

    #[test]
    fn saved_appointments_are_listed_by_time() {
        let store = RecordStore::temporary();
        seed_defaults(&store).unwrap();
        let mut panel = VerticalPanel::<Scheduling>::new(store.clone());
        for (field, value) in [
            ("patientName", "Ada"),
            ("mrn", "X1"),
            ("date", "2024-12-01"),
            ("time", "10:00"),
            ("provider", "Dr. Who"),
            ("reason", "Checkup"),
        ] {
            panel.edit_field(field, value).unwrap();
        }
        let id = panel.save().unwrap();
        assert_eq!(panel.phase(), Phase::Completed);

        let ids: Vec<&str> = panel.records().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["default-appointment", id.as_str()]);
        assert_eq!(store.list_by_status::<Appointment>("scheduled").unwrap().len(), 2);
        assert_eq!(
            store.get::<Appointment>("default-appointment").unwrap().unwrap().timestamp,
            Utc.with_ymd_and_hms(2025, 2, 21, 17, 40, 0).unwrap()
        );
    }
}
