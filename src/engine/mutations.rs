use crate::limits::*;
use crate::model::*;

use super::error::{EngineError, Rejection};
use super::validate::{now_ms, validate_booking, validate_timestamps};
use super::Engine;

/// Candidate fields for a new booking. The facility comes from the
/// caller's filter context, not from the end user directly.
#[derive(Debug, Clone)]
pub struct BookingDraft {
    /// Explicit id, or None to let the store assign one.
    pub id: Option<BookingId>,
    pub facility_name: String,
    pub room_name: String,
    pub username: String,
    pub start_at: Ms,
    pub end_at: Ms,
}

/// Partial fields for an update; None leaves the current value in place.
/// `flag` is doubly optional so it can be set, cleared, or left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub facility_name: Option<String>,
    pub room_name: Option<String>,
    pub username: Option<String>,
    pub start_at: Option<Ms>,
    pub end_at: Option<Ms>,
    pub flag: Option<Option<String>>,
}

/// Outcome of a create attempt. Rejections are normal business results,
/// not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Booking),
    Rejected(Rejection),
}

/// Outcome of an update attempt. A rejection echoes the authoritative
/// current row so the caller can resynchronize its view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated(Booking),
    Rejected { reason: Rejection, current: Booking },
}

/// Partial fields for a room edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub tags: Option<Vec<String>>,
    pub flag: Option<Option<String>>,
}

/// What kind of edit a room update turned out to be, for user-facing
/// confirmation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomUpdateKind {
    FlagResolved,
    FlagSet,
    TagAdded,
    TagRemoved,
    TagUpdated,
    Other,
}

impl RoomUpdateKind {
    pub fn message(&self) -> &'static str {
        match self {
            RoomUpdateKind::FlagResolved => "Flag resolved.",
            RoomUpdateKind::FlagSet => "Flag set.",
            RoomUpdateKind::TagAdded => "Tag added.",
            RoomUpdateKind::TagRemoved => "Tag removed.",
            RoomUpdateKind::TagUpdated => "Tag updated.",
            RoomUpdateKind::Other => "Room updated.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomUpdate {
    pub kind: RoomUpdateKind,
    /// The flag text that was cleared, when the edit resolved a flag.
    pub old_flag: Option<String>,
    pub room: Room,
}

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_tags(tags: &[String]) -> Result<(), EngineError> {
    if tags.len() > MAX_TAGS_PER_ROOM {
        return Err(EngineError::LimitExceeded("too many tags"));
    }
    if tags.iter().any(|t| t.len() > MAX_TAG_LEN) {
        return Err(EngineError::LimitExceeded("tag too long"));
    }
    Ok(())
}

fn check_flag(flag: &Option<String>) -> Result<(), EngineError> {
    if let Some(f) = flag
        && f.len() > MAX_FLAG_LEN {
            return Err(EngineError::LimitExceeded("flag too long"));
        }
    Ok(())
}

impl Engine {
    /// Create a booking: tentative insert, validate the post-insert state,
    /// roll back on rejection. The store write lock held for the whole
    /// section is what makes the overlap check race-free — a concurrent
    /// create for the same slot serializes behind us and sees our row.
    pub async fn create_booking(
        &self,
        draft: BookingDraft,
        actor: &Actor,
        offset_minutes: i32,
    ) -> Result<CreateOutcome, EngineError> {
        check_name(&draft.facility_name, "facility name")?;
        check_name(&draft.room_name, "room name")?;
        check_name(&draft.username, "username")?;
        validate_timestamps(draft.start_at, draft.end_at)?;

        let mut store = self.write_store().await;
        if store.booking_count() >= MAX_BOOKINGS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }

        let id = match draft.id {
            Some(id) => id,
            None => store.allocate_id(),
        };
        let booking = Booking {
            id,
            facility_name: draft.facility_name,
            room_name: draft.room_name,
            username: draft.username,
            start_at: draft.start_at,
            end_at: draft.end_at,
            flag: None,
        };

        store.insert_booking(booking.clone())?;

        if let Err(reason) = validate_booking(&store, &booking, actor, offset_minutes, now_ms()) {
            store.remove_booking(id);
            metrics::counter!(
                crate::observability::BOOKING_REJECTIONS_TOTAL,
                "reason" => reason.label()
            )
            .increment(1);
            return Ok(CreateOutcome::Rejected(reason));
        }

        let event = Event::BookingCreated { booking: booking.clone() };
        if let Err(e) = self.wal_append(&event).await {
            store.remove_booking(id);
            return Err(e);
        }
        self.notify.send(&booking.facility_name, &event);
        Ok(CreateOutcome::Created(booking))
    }

    /// Update a booking: merge the patch onto the current row, validate
    /// the merged candidate (excluding its own id), and restore the
    /// unmodified row on any failure path.
    pub async fn update_booking(
        &self,
        id: BookingId,
        patch: BookingPatch,
        actor: &Actor,
        offset_minutes: i32,
    ) -> Result<UpdateOutcome, EngineError> {
        let mut store = self.write_store().await;
        let current = store
            .get_booking(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let merged = Booking {
            id,
            facility_name: patch.facility_name.unwrap_or_else(|| current.facility_name.clone()),
            room_name: patch.room_name.unwrap_or_else(|| current.room_name.clone()),
            username: patch.username.unwrap_or_else(|| current.username.clone()),
            start_at: patch.start_at.unwrap_or(current.start_at),
            end_at: patch.end_at.unwrap_or(current.end_at),
            flag: patch.flag.unwrap_or_else(|| current.flag.clone()),
        };
        check_name(&merged.facility_name, "facility name")?;
        check_name(&merged.room_name, "room name")?;
        check_name(&merged.username, "username")?;
        check_flag(&merged.flag)?;
        validate_timestamps(merged.start_at, merged.end_at)?;

        store.replace_booking(merged.clone())?;

        if let Err(reason) = validate_booking(&store, &merged, actor, offset_minutes, now_ms()) {
            store
                .replace_booking(current.clone())
                .expect("restoring previous row");
            metrics::counter!(
                crate::observability::BOOKING_REJECTIONS_TOTAL,
                "reason" => reason.label()
            )
            .increment(1);
            return Ok(UpdateOutcome::Rejected { reason, current });
        }

        let event = Event::BookingUpdated { booking: merged.clone() };
        if let Err(e) = self.wal_append(&event).await {
            store
                .replace_booking(current)
                .expect("restoring previous row");
            return Err(e);
        }
        self.notify.send(&merged.facility_name, &event);
        if merged.facility_name != current.facility_name {
            // The booking left its old facility's calendar too.
            self.notify.send(&current.facility_name, &event);
        }
        Ok(UpdateOutcome::Updated(merged))
    }

    /// Delete a booking. No validation — freeing a slot cannot create a
    /// conflict. Deleting a missing id is a NotFound fault.
    pub async fn delete_booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        let mut store = self.write_store().await;
        let removed = store.remove_booking(id).ok_or(EngineError::NotFound(id))?;

        let event = Event::BookingDeleted { id };
        if let Err(e) = self.wal_append(&event).await {
            store
                .insert_booking(removed)
                .expect("restoring removed row");
            return Err(e);
        }
        self.notify.send(&removed.facility_name, &event);
        Ok(removed)
    }

    pub async fn create_room(
        &self,
        facility_name: String,
        name: String,
        tags: Vec<String>,
    ) -> Result<Room, EngineError> {
        check_name(&facility_name, "facility name")?;
        check_name(&name, "room name")?;
        check_tags(&tags)?;

        let mut store = self.write_store().await;
        if store.room_count() >= MAX_ROOMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if store.get_room(&facility_name, &name).is_some() {
            return Err(EngineError::RoomExists { facility_name, name });
        }

        let room = Room {
            facility_name,
            name,
            tags,
            flag: None,
        };
        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        store.insert_room(room.clone());
        self.notify.send(&room.facility_name, &event);
        Ok(room)
    }

    /// Edit a room's tags and/or flag, classifying the edit for the
    /// user-facing confirmation message. Resolving a flag reports the
    /// cleared text.
    pub async fn update_room(
        &self,
        facility_name: &str,
        name: &str,
        patch: RoomPatch,
    ) -> Result<RoomUpdate, EngineError> {
        if let Some(ref tags) = patch.tags {
            check_tags(tags)?;
        }
        if let Some(ref flag) = patch.flag {
            check_flag(flag)?;
        }

        let mut store = self.write_store().await;
        let current = store
            .get_room(facility_name, name)
            .cloned()
            .ok_or_else(|| EngineError::RoomNotFound {
                facility_name: facility_name.to_string(),
                name: name.to_string(),
            })?;

        let tags_unchanged = match &patch.tags {
            None => true,
            Some(tags) => *tags == current.tags,
        };
        let new_tags = patch.tags.unwrap_or_else(|| current.tags.clone());
        let new_flag = patch.flag.clone().unwrap_or_else(|| current.flag.clone());

        let kind = if patch.flag == Some(None) && current.flag.is_some() && tags_unchanged {
            RoomUpdateKind::FlagResolved
        } else if matches!(patch.flag, Some(Some(_))) && tags_unchanged {
            RoomUpdateKind::FlagSet
        } else if new_tags.len() > current.tags.len() {
            RoomUpdateKind::TagAdded
        } else if new_tags.len() < current.tags.len() {
            RoomUpdateKind::TagRemoved
        } else if !tags_unchanged {
            RoomUpdateKind::TagUpdated
        } else {
            RoomUpdateKind::Other
        };
        let old_flag = match kind {
            RoomUpdateKind::FlagResolved => current.flag.clone(),
            _ => None,
        };

        let room = Room {
            facility_name: current.facility_name,
            name: current.name,
            tags: new_tags,
            flag: new_flag,
        };
        let event = Event::RoomUpdated { room: room.clone() };
        self.wal_append(&event).await?;
        store.insert_room(room.clone());
        self.notify.send(&room.facility_name, &event);

        Ok(RoomUpdate { kind, old_flag, room })
    }
}
