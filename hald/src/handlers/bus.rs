// SPDX-License-Identifier: GPL-2.0

//! Handlers for physical bus subsystems

use crate::device::{Device, UDI_PREFIX};
use crate::store::DeviceStore;
use crate::sysfs;

use super::{parent_udi_or_computer, unknown_hex_name};

fn new_bus_device(sysfs_path: &str, subsystem: &str, parent: Option<&Device>) -> Device {
	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	d.set_string("info.subsystem", subsystem);
	d.set_string("info.bus", subsystem);
	d.set_string("info.parent", &parent_udi_or_computer(parent));
	sysfs::set_driver(&mut d, "info.linux.driver", sysfs_path);
	d
}

/*---------------------------------------------------------------------------*/

pub fn pci_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	let mut d = new_bus_device(sysfs_path, "pci", parent);

	d.set_string("pci.linux.sysfs_path", sysfs_path);
	sysfs::set_int_from_file(&mut d, "pci.product_id", sysfs_path, "device", 16);
	sysfs::set_int_from_file(&mut d, "pci.vendor_id", sysfs_path, "vendor", 16);
	sysfs::set_int_from_file(&mut d, "pci.subsys_product_id", sysfs_path, "subsystem_device", 16);
	sysfs::set_int_from_file(&mut d, "pci.subsys_vendor_id", sysfs_path, "subsystem_vendor", 16);

	if let Some(class) = sysfs::get_int_from_file(sysfs_path, "class", 16) {
		d.set_int("pci.device_class", (class >> 16) & 0xff);
		d.set_int("pci.device_subclass", (class >> 8) & 0xff);
		d.set_int("pci.device_protocol", class & 0xff);
	}

	let vendor_id = d.get_int("pci.vendor_id").unwrap_or(0);
	let product_id = d.get_int("pci.product_id").unwrap_or(0);
	d.set_string("info.vendor", &unknown_hex_name(vendor_id));
	d.set_string("info.product", &unknown_hex_name(product_id));

	Some(d)
}

pub fn pci_compute_udi(d: &Device) -> String {
	format!(
		"{}/pci_{:x}_{:x}",
		UDI_PREFIX,
		d.get_int("pci.vendor_id").unwrap_or(0),
		d.get_int("pci.product_id").unwrap_or(0)
	)
}

/*---------------------------------------------------------------------------*/

fn usbif_name(ifclass: i64) -> &'static str {
	match ifclass {
		0x01 => "USB Audio Interface",
		0x02 => "USB Communications Interface",
		0x03 => "USB HID Interface",
		0x06 => "USB Imaging Interface",
		0x07 => "USB Printer Interface",
		0x08 => "USB Mass Storage Interface",
		0x09 => "USB Hub Interface",
		0x0a => "USB Data Interface",
		0x0b => "USB Chip/Smartcard Interface",
		0x0d => "USB Content Security Interface",
		0x0e => "USB Video Interface",
		0xe0 => "USB Wireless Interface",
		_ => "USB Interface",
	}
}

/// Covers both whole USB devices and their interfaces; only interfaces
/// carry a `:` in the bus id.
pub fn usb_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	let bus_id = sysfs::last_element(sysfs_path);

	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	if let Some(p) = parent {
		d.set_string("info.parent", p.udi());
	}

	if !bus_id.contains(':') {
		d.set_string("info.subsystem", "usb_device");
		d.set_string("info.bus", "usb_device");
		sysfs::set_driver(&mut d, "info.linux.driver", sysfs_path);

		d.set_string("usb_device.linux.sysfs_path", sysfs_path);

		sysfs::set_int_from_file(&mut d, "usb_device.configuration_value", sysfs_path, "bConfigurationValue", 10);
		sysfs::set_int_from_file(&mut d, "usb_device.num_configurations", sysfs_path, "bNumConfigurations", 10);
		sysfs::set_int_from_file(&mut d, "usb_device.num_interfaces", sysfs_path, "bNumInterfaces", 10);

		sysfs::set_int_from_file(&mut d, "usb_device.device_class", sysfs_path, "bDeviceClass", 16);
		sysfs::set_int_from_file(&mut d, "usb_device.device_subclass", sysfs_path, "bDeviceSubClass", 16);
		sysfs::set_int_from_file(&mut d, "usb_device.device_protocol", sysfs_path, "bDeviceProtocol", 16);

		sysfs::set_int_from_file(&mut d, "usb_device.vendor_id", sysfs_path, "idVendor", 16);
		sysfs::set_int_from_file(&mut d, "usb_device.product_id", sysfs_path, "idProduct", 16);

		if sysfs::set_string_from_file(&mut d, "usb_device.vendor", sysfs_path, "manufacturer") {
			let vendor = d.get_string("usb_device.vendor").unwrap_or("").to_string();
			d.set_string("info.vendor", &vendor);
		} else {
			let id = d.get_int("usb_device.vendor_id").unwrap_or(0);
			d.set_string("info.vendor", &unknown_hex_name(id));
		}
		if sysfs::set_string_from_file(&mut d, "usb_device.product", sysfs_path, "product") {
			let product = d.get_string("usb_device.product").unwrap_or("").to_string();
			d.set_string("info.product", &product);
		} else {
			let id = d.get_int("usb_device.product_id").unwrap_or(0);
			d.set_string("info.product", &unknown_hex_name(id));
		}

		sysfs::set_int_from_file(&mut d, "usb_device.device_revision_bcd", sysfs_path, "bcdDevice", 16);
		sysfs::set_int_from_file(&mut d, "usb_device.max_power", sysfs_path, "bMaxPower", 10);
		sysfs::set_int_from_file(&mut d, "usb_device.num_ports", sysfs_path, "maxchild", 10);
		sysfs::set_int_from_file(&mut d, "usb_device.linux.device_number", sysfs_path, "devnum", 10);
		sysfs::set_string_from_file(&mut d, "usb_device.serial", sysfs_path, "serial");
		sysfs::set_bcd2_from_file(&mut d, "usb_device.speed_bcd", sysfs_path, "speed");
		sysfs::set_bcd2_from_file(&mut d, "usb_device.version_bcd", sysfs_path, "version");

		if let Some(attrs) = sysfs::get_int_from_file(sysfs_path, "bmAttributes", 16) {
			d.set_bool("usb_device.is_self_powered", (attrs & 0x40) != 0);
			d.set_bool("usb_device.can_wake_up", (attrs & 0x20) != 0);
		}

		let bus_number = bus_id
			.trim_start_matches("usb")
			.split(|c: char| !c.is_ascii_digit())
			.next()
			.and_then(|t| t.parse::<i64>().ok());
		if let Some(n) = bus_number {
			d.set_int("usb_device.bus_number", n);
		}
	} else {
		d.set_string("info.subsystem", "usb");
		d.set_string("info.bus", "usb");

		// project all usb_device.* properties of the parent as usb.* here
		if let Some(p) = parent {
			d.merge_with_rewrite(p, "usb.", "usb_device.");
		}
		sysfs::set_driver(&mut d, "info.linux.driver", sysfs_path);

		d.set_string("usb.linux.sysfs_path", sysfs_path);
		sysfs::set_int_from_file(&mut d, "usb.interface.number", sysfs_path, "bInterfaceNumber", 10);
		sysfs::set_int_from_file(&mut d, "usb.interface.class", sysfs_path, "bInterfaceClass", 16);
		sysfs::set_int_from_file(&mut d, "usb.interface.subclass", sysfs_path, "bInterfaceSubClass", 16);
		sysfs::set_int_from_file(&mut d, "usb.interface.protocol", sysfs_path, "bInterfaceProtocol", 16);

		let ifclass = d.get_int("usb.interface.class").unwrap_or(0);
		d.set_string("info.product", usbif_name(ifclass));
	}

	Some(d)
}

pub fn usb_compute_udi(d: &Device) -> String {
	if d.has_property("usb.interface.number") {
		format!(
			"{}_if{}",
			d.string_or_empty("info.parent"),
			d.get_int("usb.interface.number").unwrap_or(0)
		)
	} else {
		let serial = d
			.get_string("usb_device.serial")
			.unwrap_or("noserial");
		format!(
			"{}/usb_device_{:x}_{:x}_{}",
			UDI_PREFIX,
			d.get_int("usb_device.vendor_id").unwrap_or(0),
			d.get_int("usb_device.product_id").unwrap_or(0),
			serial
		)
	}
}

/*---------------------------------------------------------------------------*/

pub fn ide_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	let mut d = new_bus_device(sysfs_path, "ide", parent);

	// bus id has the form <host>.<channel>
	let bus_id = sysfs::last_element(sysfs_path);
	let mut parts = bus_id.splitn(2, '.');
	let host = parts.next().and_then(|t| t.parse::<i64>().ok());
	let channel = parts.next().and_then(|t| t.parse::<i64>().ok());
	if let (Some(host), Some(channel)) = (host, channel) {
		d.set_int("ide.host", host);
		d.set_int("ide.channel", channel);
	}

	Some(d)
}

pub fn ide_compute_udi(d: &Device) -> String {
	format!(
		"{}_ide_{}_{}",
		d.string_or_empty("info.parent"),
		d.get_int("ide.host").unwrap_or(0),
		d.get_int("ide.channel").unwrap_or(0)
	)
}

/*---------------------------------------------------------------------------*/

pub fn pnp_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	let mut d = new_bus_device(sysfs_path, "pnp", parent);
	sysfs::set_string_from_file(&mut d, "pnp.id", sysfs_path, "id");
	if let Ok(id) = d.get_string("pnp.id") {
		let product = format!("PnP Device ({})", id);
		d.set_string("info.product", &product);
	}
	Some(d)
}

pub fn pnp_compute_udi(d: &Device) -> String {
	match d.get_string("pnp.id") {
		Ok(id) => format!("{}/pnp_{}", UDI_PREFIX, id),
		Err(_) => format!("{}/pnp_unknown", UDI_PREFIX),
	}
}

/*---------------------------------------------------------------------------*/

pub fn platform_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	let mut d = new_bus_device(sysfs_path, "platform", parent);
	let dev_id = sysfs::last_element(sysfs_path);
	d.set_string("platform.id", dev_id);
	let product = format!("Platform Device ({})", dev_id);
	d.set_string("info.product", &product);
	Some(d)
}

pub fn platform_compute_udi(d: &Device) -> String {
	format!(
		"{}/platform_{}",
		UDI_PREFIX,
		d.string_or_empty("platform.id")
	)
}

/*---------------------------------------------------------------------------*/

pub fn serio_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	let mut d = new_bus_device(sysfs_path, "serio", parent);
	d.set_string("serio.id", sysfs::last_element(sysfs_path));
	if !sysfs::set_string_from_file(&mut d, "serio.description", sysfs_path, "description") {
		let id = d.string_or_empty("serio.id").to_string();
		d.set_string("serio.description", &id);
	}
	let desc = d.string_or_empty("serio.description").to_string();
	d.set_string("info.product", &desc);
	Some(d)
}

pub fn serio_compute_udi(d: &Device) -> String {
	format!(
		"{}_{}",
		d.string_or_empty("info.parent"),
		d.string_or_empty("serio.id")
	)
}

/*---------------------------------------------------------------------------*/

pub fn scsi_host_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	parent?;
	let mut d = new_bus_device(sysfs_path, "scsi_host", parent);
	let host = sysfs::last_element(sysfs_path)
		.trim_start_matches("host")
		.parse::<i64>()
		.ok()?;
	d.set_int("scsi_host.host", host);
	d.set_string("info.category", "scsi_host");
	d.add_capability("scsi_host");
	d.set_string("info.product", "SCSI Host Adapter");
	Some(d)
}

pub fn scsi_host_compute_udi(d: &Device) -> String {
	format!(
		"{}_scsi_host_{}",
		d.string_or_empty("info.parent"),
		d.get_int("scsi_host.host").unwrap_or(0)
	)
}

/*---------------------------------------------------------------------------*/

pub fn scsi_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	parent?;
	let mut d = new_bus_device(sysfs_path, "scsi", parent);

	// bus id has the form <host>:<bus>:<target>:<lun>
	let bus_id = sysfs::last_element(sysfs_path);
	let fields: Vec<i64> = bus_id
		.split(':')
		.filter_map(|t| t.parse::<i64>().ok())
		.collect();
	if fields.len() != 4 {
		return None;
	}
	d.set_int("scsi.host", fields[0]);
	d.set_int("scsi.bus", fields[1]);
	d.set_int("scsi.target", fields[2]);
	d.set_int("scsi.lun", fields[3]);
	d.set_string("info.product", "SCSI Device");

	sysfs::set_string_from_file(&mut d, "scsi.model", sysfs_path, "model");
	sysfs::set_string_from_file(&mut d, "scsi.vendor", sysfs_path, "vendor");
	if let Some(t) = sysfs::get_int_from_file(sysfs_path, "type", 10) {
		d.set_int("scsi.type", t);
	}

	Some(d)
}

pub fn scsi_compute_udi(d: &Device) -> String {
	format!(
		"{}_scsi_device_lun{}",
		d.string_or_empty("info.parent"),
		d.get_int("scsi.lun").unwrap_or(0)
	)
}

/*---------------------------------------------------------------------------*/

pub fn scsi_generic_add(
	sysfs_path: &str,
	device_file: Option<&str>,
	parent: Option<&Device>,
) -> Option<Device> {
	parent?;
	let mut d = Device::new();
	d.set_string("linux.sysfs_path", sysfs_path);
	d.set_string("info.subsystem", "scsi_generic");
	d.set_string("info.parent", &parent_udi_or_computer(parent));
	d.set_string("info.category", "scsi_generic");
	d.add_capability("scsi_generic");
	d.set_string("info.product", "SCSI Generic Interface");
	if let Some(f) = device_file {
		d.set_string("scsi_generic.device", f);
	}
	Some(d)
}

pub fn scsi_generic_compute_udi(d: &Device) -> String {
	format!("{}_scsi_generic", d.string_or_empty("info.parent"))
}

/*---------------------------------------------------------------------------*/

pub fn mmc_host_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	parent?;
	let mut d = new_bus_device(sysfs_path, "mmc_host", parent);
	let host = sysfs::last_element(sysfs_path)
		.trim_start_matches("mmc")
		.parse::<i64>()
		.ok()?;
	d.set_int("mmc_host.host", host);
	d.set_string("info.product", "MMC/SD Host Adapter");
	Some(d)
}

pub fn mmc_host_compute_udi(d: &Device) -> String {
	format!(
		"{}_mmc_host_{}",
		d.string_or_empty("info.parent"),
		d.get_int("mmc_host.host").unwrap_or(0)
	)
}

/*---------------------------------------------------------------------------*/

pub fn mmc_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	parent?;
	let mut d = new_bus_device(sysfs_path, "mmc", parent);

	// bus id has the form mmc<host>:<rca in hex>
	let bus_id = sysfs::last_element(sysfs_path);
	let rca = bus_id
		.split(':')
		.nth(1)
		.and_then(|t| i64::from_str_radix(t, 16).ok())
		.unwrap_or(0);
	d.set_int("mmc.rca", rca);

	sysfs::set_string_from_file(&mut d, "mmc.cid", sysfs_path, "cid");
	sysfs::set_string_from_file(&mut d, "mmc.csd", sysfs_path, "csd");

	// an all-zero SCR means the card did not report one
	let scr = sysfs::read_attr(sysfs_path, "scr").filter(|s| s != "0000000000000000");
	if let Some(scr) = &scr {
		d.set_string("mmc.scr", scr);
	}

	if !sysfs::set_string_from_file(&mut d, "info.product", sysfs_path, "name") {
		if scr.is_some() {
			d.set_string("info.product", "SD Card");
			d.set_string("mmc.product", "SD Card");
		} else {
			d.set_string("mmc.product", "MMC Card");
		}
	}

	if let Some(manfid) = sysfs::get_int_from_file(sysfs_path, "manfid", 16) {
		let vendor = super::unknown_dec_name(manfid);
		d.set_string("info.vendor", &vendor);
		d.set_string("mmc.vendor", &vendor);
	}
	if let Some(oemid) = sysfs::get_int_from_file(sysfs_path, "oemid", 16) {
		d.set_string("mmc.oem", &super::unknown_dec_name(oemid));
	}

	sysfs::set_string_from_file(&mut d, "mmc.date", sysfs_path, "date");
	sysfs::set_int_from_file(&mut d, "mmc.hwrev", sysfs_path, "hwrev", 16);
	sysfs::set_int_from_file(&mut d, "mmc.fwrev", sysfs_path, "fwrev", 16);
	sysfs::set_int_from_file(&mut d, "mmc.serial", sysfs_path, "serial", 16);

	Some(d)
}

pub fn mmc_compute_udi(d: &Device) -> String {
	format!(
		"{}_mmc_card_rca{}",
		d.string_or_empty("info.parent"),
		d.get_int("mmc.rca").unwrap_or(0)
	)
}

/*---------------------------------------------------------------------------*/

pub fn ieee1394_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	parent?;
	let mut d = new_bus_device(sysfs_path, "ieee1394", parent);
	if let Some(guid) = sysfs::get_uint64_from_file(sysfs_path, "guid", 16) {
		d.set_uint64("ieee1394.guid", guid);
	}
	sysfs::set_string_from_file(&mut d, "ieee1394.vendor", sysfs_path, "vendor_name_kv");
	if let Ok(v) = d.get_string("ieee1394.vendor") {
		let v = v.to_string();
		d.set_string("info.vendor", &v);
	}
	Some(d)
}

pub fn ieee1394_compute_udi(d: &Device) -> String {
	format!(
		"{}/ieee1394_guid_{:x}",
		UDI_PREFIX,
		d.get_uint64("ieee1394.guid").unwrap_or(0)
	)
}

/*---------------------------------------------------------------------------*/

pub fn xen_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	let mut d = new_bus_device(sysfs_path, "xen", parent);
	let bus_id = sysfs::last_element(sysfs_path);
	d.set_string("xen.bus_id", bus_id);
	sysfs::set_string_from_file(&mut d, "xen.path", sysfs_path, "nodename");
	if let Some(devtype) = sysfs::read_attr(sysfs_path, "devtype") {
		d.set_string("xen.type", &devtype);
		let product = match devtype.as_str() {
			"vif" => "Xen Virtual Ethernet".to_string(),
			"vbd" => "Xen Virtual Block Device".to_string(),
			other => format!("Xen Device ({})", other),
		};
		d.set_string("info.product", &product);
	}
	Some(d)
}

pub fn xen_compute_udi(d: &Device) -> String {
	format!(
		"{}/xen_{}",
		UDI_PREFIX,
		d.string_or_empty("xen.bus_id")
	)
}

/*---------------------------------------------------------------------------*/

pub fn pseudo_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	let mut d = new_bus_device(sysfs_path, "pseudo", parent);
	d.set_string("info.product", "Virtual Device");
	Some(d)
}

pub fn pseudo_compute_udi(d: &Device) -> String {
	format!("{}_pseudo", d.string_or_empty("info.parent"))
}

/*---------------------------------------------------------------------------*/

pub fn backlight_add(sysfs_path: &str, parent: Option<&Device>) -> Option<Device> {
	let mut d = new_bus_device(sysfs_path, "backlight", parent);
	d.set_string("info.category", "laptop_panel");
	d.add_capability("laptop_panel");
	d.set_string("info.product", "Laptop Panel");
	if let Some(levels) = sysfs::get_int_from_file(sysfs_path, "max_brightness", 10) {
		d.set_int("laptop_panel.num_levels", levels + 1);
	}
	Some(d)
}

pub fn backlight_compute_udi(d: &Device) -> String {
	format!("{}_backlight", d.string_or_empty("info.parent"))
}

pub fn backlight_refresh(store: &mut DeviceStore, udi: &str, sysfs_path: &str) {
	if let Some(v) = sysfs::get_int_from_file(sysfs_path, "actual_brightness", 10) {
		let _ = store.set_int(udi, "laptop_panel.brightness", v);
	}
}
