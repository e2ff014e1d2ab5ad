// Licensed under the Apache-2.0 license

//! `bootcfg.txt`, read by the Boot ROM and the SPL when booting or upgrading
//! from an SD card or USB disk.

use crate::component::{Component, Section};

const HEADER: &str = "\
# Boot configuration file
# Used in SD Card FAT32 boot and USB Disk upgrade.
# Format:
# protection=part1 name,part2 name,part3 name
#   Protects partitions from being overwritten when they are upgraded.
# boot0=size@offset
#   boot0 size and location offset in 'image' file, boot rom read it.
# boot0=example.bin
#   boot0 image is file example.bin, boot rom read it.
# boot1=size@offset
#   boot1 size and location offset in 'image' file, boot0 read it.
# boot1=example.bin
#   boot1 image is file example.bin, boot0 read it.
# image=example.img
#   Packed image file is example.img, boot1 use it.


";

/// Updater component name and the key it is published under.
const BOOT_KEYS: [(&str, &str); 4] = [
    ("spl", "boot0"),
    ("uboot", "boot1"),
    ("env", "env"),
    ("logo", "logo"),
];

/// Renders the boot-config text. `components` must already carry their
/// container offsets.
pub fn generate_bootcfg(components: &[Component], image_name: &str) -> String {
    let mut text = String::from(HEADER);
    for (name, key) in BOOT_KEYS {
        let Some(comp) = components
            .iter()
            .find(|c| c.section == Section::Updater && c.name == name && c.is_present())
        else {
            continue;
        };
        text.push_str(&format!("# {}\n", comp.config.file));
        text.push_str(&format!("{}={:#x}@{:#x}\n", key, comp.file_size, comp.file_offset));
    }
    text.push_str(&format!("image={}\n", image_name));
    text
}
