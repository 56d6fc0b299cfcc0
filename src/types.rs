use dicom::core::PrimitiveValue;
use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// UL (Unsigned Long) value representation.
pub type UL = u32;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone)]
pub enum DimsePriority {
	Low = 0x0002,
	Medium = 0x0000,
	High = 0x0001,
}

impl Default for DimsePriority {
	fn default() -> Self {
		Self::Medium
	}
}

/// Queue priority of an extract request. Valid range is 1 (lowest) to
/// 5 (highest); the broker queues are declared with `x-max-priority = 5`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueuePriority(u8);

impl QueuePriority {
	pub const MIN: u8 = 1;
	pub const MAX: u8 = 5;

	pub const fn new(value: u8) -> Option<Self> {
		if value >= Self::MIN && value <= Self::MAX {
			Some(Self(value))
		} else {
			None
		}
	}

	pub const fn get(self) -> u8 {
		self.0
	}
}

impl Default for QueuePriority {
	fn default() -> Self {
		Self(Self::MIN)
	}
}

impl Display for QueuePriority {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<QueuePriority> for DimsePriority {
	fn from(priority: QueuePriority) -> Self {
		match priority.get() {
			4 | 5 => Self::High,
			3 => Self::Medium,
			_ => Self::Low,
		}
	}
}

/// The DICOM source an extract request is resolved against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SourceKind {
	Primary,
	Secondary,
}

impl Display for SourceKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Primary => write!(f, "primary"),
			Self::Secondary => write!(f, "secondary"),
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryRetrieveLevel {
	Patient,
	Study,
	Series,
	Image,
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Patient => write!(f, "PATIENT"),
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Image => write!(f, "IMAGE"),
		}
	}
}

impl From<QueryRetrieveLevel> for PrimitiveValue {
	fn from(level: QueryRetrieveLevel) -> Self {
		Self::Str(level.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn queue_priority_range() {
		assert!(QueuePriority::new(0).is_none());
		assert!(QueuePriority::new(6).is_none());
		assert_eq!(QueuePriority::new(5).unwrap().get(), 5);
		assert_eq!(QueuePriority::default().get(), 1);
	}

	#[test]
	fn queue_priority_maps_to_dimse_priority() {
		assert!(matches!(
			DimsePriority::from(QueuePriority::new(5).unwrap()),
			DimsePriority::High
		));
		assert!(matches!(
			DimsePriority::from(QueuePriority::new(3).unwrap()),
			DimsePriority::Medium
		));
		assert!(matches!(
			DimsePriority::from(QueuePriority::new(1).unwrap()),
			DimsePriority::Low
		));
	}
}
