//! Data models for Photo Diary

mod action;
mod destination;
mod entry;

pub use action::{ActionId, ActionKind, DeadLetter, Mutation, PendingAction, TargetStatus};
pub use destination::{Destination, GroupId};
pub use entry::{normalize_tags, Entry, EntryId, Location, Palette};
