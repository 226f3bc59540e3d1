// SPDX-License-Identifier: GPL-2.0

//! Message-bus collaborator boundary

use crate::store::StoreEvent;

/// Requests the bus collaborator feeds into the event loop
#[derive(Debug, Clone, PartialEq)]
pub enum BusRequest {
	/// Re-read state of one device (Rescan method)
	Rescan { udi: String },
	/// Tear the device subtree down and rebuild it (Reprobe method)
	Reprobe { udi: String },
	/// An addon declared itself ready for its device
	AddonReady { udi: String },
	/// Device-level lock operation
	AcquireLock { udi: String, lock: String, owner: String },
	ReleaseLock { udi: String, lock: String, owner: String },
	/// Manager-wide lock operation
	AcquireManagerLock { lock: String, owner: String },
	ReleaseManagerLock { lock: String, owner: String },
}

/// Outbound signal surface consumed by the IPC server.
///
/// The core does not care about the wire format; it calls these hooks and
/// the collaborator turns them into bus signals.
pub trait BusLink {
	fn device_added(&mut self, udi: &str);
	fn device_removed(&mut self, udi: &str);
	fn property_modified(&mut self, udi: &str, key: &str, added: bool, removed: bool);
	fn capability_added(&mut self, udi: &str, capability: &str);
	fn device_lock_acquired(&mut self, udi: &str, lock: &str, owner: &str);
	fn device_lock_released(&mut self, udi: &str, lock: &str, owner: &str);
	fn manager_lock_acquired(&mut self, lock: &str, owner: &str);
	fn manager_lock_released(&mut self, lock: &str, owner: &str);
	fn condition(&mut self, udi: &str, name: &str, detail: &str);
	/// Coldplug finished and the queue drained for the first time
	fn probe_complete(&mut self);
}

/// Forward a batch of store hooks as externally visible signals.
pub fn forward_store_events(bus: &mut dyn BusLink, events: &[StoreEvent]) {
	for event in events {
		match event {
			StoreEvent::DeviceAdded { udi } => bus.device_added(udi),
			StoreEvent::DeviceRemoved { udi } => bus.device_removed(udi),
			StoreEvent::PropertyModified { udi, key, added, removed } => {
				bus.property_modified(udi, key, *added, *removed)
			}
			StoreEvent::CapabilityAdded { udi, capability } => {
				bus.capability_added(udi, capability)
			}
			StoreEvent::LockAcquired { udi, lock, owner } => {
				bus.device_lock_acquired(udi, lock, owner)
			}
			StoreEvent::LockReleased { udi, lock, owner } => {
				bus.device_lock_released(udi, lock, owner)
			}
		}
	}
}

/// Default collaborator: logs every signal. Used when no bus server is
/// wired in.
#[derive(Debug, Default)]
pub struct LoggingBus;

impl BusLink for LoggingBus {
	fn device_added(&mut self, udi: &str) {
		crate::info!("signal DeviceAdded {}", udi);
	}

	fn device_removed(&mut self, udi: &str) {
		crate::info!("signal DeviceRemoved {}", udi);
	}

	fn property_modified(&mut self, udi: &str, key: &str, added: bool, removed: bool) {
		crate::debug!("signal PropertyModified {} {} added={} removed={}", udi, key, added, removed);
	}

	fn capability_added(&mut self, udi: &str, capability: &str) {
		crate::debug!("signal NewCapability {} {}", udi, capability);
	}

	fn device_lock_acquired(&mut self, udi: &str, lock: &str, owner: &str) {
		crate::info!("signal InterfaceLockAcquired {} {} by {}", udi, lock, owner);
	}

	fn device_lock_released(&mut self, udi: &str, lock: &str, owner: &str) {
		crate::info!("signal InterfaceLockReleased {} {} by {}", udi, lock, owner);
	}

	fn manager_lock_acquired(&mut self, lock: &str, owner: &str) {
		crate::info!("signal GlobalInterfaceLockAcquired {} by {}", lock, owner);
	}

	fn manager_lock_released(&mut self, lock: &str, owner: &str) {
		crate::info!("signal GlobalInterfaceLockReleased {} by {}", lock, owner);
	}

	fn condition(&mut self, udi: &str, name: &str, detail: &str) {
		crate::info!("signal Condition {} {} {}", udi, name, detail);
	}

	fn probe_complete(&mut self) {
		crate::info!("probing completed, device graph published");
	}
}

/// Recorded signal, for the stub collaborator below
#[derive(Debug, Clone, PartialEq)]
pub enum BusSignal {
	DeviceAdded(String),
	DeviceRemoved(String),
	PropertyModified { udi: String, key: String, added: bool, removed: bool },
	CapabilityAdded { udi: String, capability: String },
	DeviceLockAcquired { udi: String, lock: String, owner: String },
	DeviceLockReleased { udi: String, lock: String, owner: String },
	ManagerLockAcquired { lock: String, owner: String },
	ManagerLockReleased { lock: String, owner: String },
	Condition { udi: String, name: String, detail: String },
	ProbeComplete,
}

/// Stub collaborator recording every signal in order, in the spirit of the
/// dummy OS backend: useful for exercising the pipeline without a bus.
#[derive(Debug, Default)]
pub struct RecordingBus {
	pub signals: Vec<BusSignal>,
}

impl RecordingBus {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn added_udis(&self) -> Vec<String> {
		self.signals
			.iter()
			.filter_map(|s| match s {
				BusSignal::DeviceAdded(udi) => Some(udi.clone()),
				_ => None,
			})
			.collect()
	}

	pub fn removed_udis(&self) -> Vec<String> {
		self.signals
			.iter()
			.filter_map(|s| match s {
				BusSignal::DeviceRemoved(udi) => Some(udi.clone()),
				_ => None,
			})
			.collect()
	}
}

impl BusLink for RecordingBus {
	fn device_added(&mut self, udi: &str) {
		self.signals.push(BusSignal::DeviceAdded(udi.to_string()));
	}

	fn device_removed(&mut self, udi: &str) {
		self.signals.push(BusSignal::DeviceRemoved(udi.to_string()));
	}

	fn property_modified(&mut self, udi: &str, key: &str, added: bool, removed: bool) {
		self.signals.push(BusSignal::PropertyModified {
			udi: udi.to_string(),
			key: key.to_string(),
			added,
			removed,
		});
	}

	fn capability_added(&mut self, udi: &str, capability: &str) {
		self.signals.push(BusSignal::CapabilityAdded {
			udi: udi.to_string(),
			capability: capability.to_string(),
		});
	}

	fn device_lock_acquired(&mut self, udi: &str, lock: &str, owner: &str) {
		self.signals.push(BusSignal::DeviceLockAcquired {
			udi: udi.to_string(),
			lock: lock.to_string(),
			owner: owner.to_string(),
		});
	}

	fn device_lock_released(&mut self, udi: &str, lock: &str, owner: &str) {
		self.signals.push(BusSignal::DeviceLockReleased {
			udi: udi.to_string(),
			lock: lock.to_string(),
			owner: owner.to_string(),
		});
	}

	fn manager_lock_acquired(&mut self, lock: &str, owner: &str) {
		self.signals.push(BusSignal::ManagerLockAcquired {
			lock: lock.to_string(),
			owner: owner.to_string(),
		});
	}

	fn manager_lock_released(&mut self, lock: &str, owner: &str) {
		self.signals.push(BusSignal::ManagerLockReleased {
			lock: lock.to_string(),
			owner: owner.to_string(),
		});
	}

	fn condition(&mut self, udi: &str, name: &str, detail: &str) {
		self.signals.push(BusSignal::Condition {
			udi: udi.to_string(),
			name: name.to_string(),
			detail: detail.to_string(),
		});
	}

	fn probe_complete(&mut self) {
		self.signals.push(BusSignal::ProbeComplete);
	}
}
