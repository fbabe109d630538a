//! Well-known names shared across the crate.

pub const APP_NAME: &str = "stratum";

/// Prefix marking an `inherits` value as an image outside the managed tree.
pub const EXTERNAL_PREFIX: &str = "external:";

/// Per-image manifest file name.
pub const MANIFEST_FILENAME: &str = "config.json";

/// Build script each image directory provides, run from inside the image directory.
pub const BUILD_SCRIPT: &str = "script";

/// Where the images directory is mounted inside a build session.
pub const IMAGES_MOUNT: &str = "/images";

/// Where the package cache is mounted inside a build session.
pub const PACKAGES_MOUNT: &str = "/packages";

/// Hook an image provides to stage its exportable content.
pub const EXPORT_HOOK: &str = "/stratum-extract";

/// Staging directory, relative to the root of a snapshot's upper layer.
pub const STAGING_DIR: &str = "extract";

/// Compressed root filesystem placed in the boot destination.
pub const ROOTFS_IMAGE: &str = "rootfs.squash";

/// Kernel image placed in the boot destination.
pub const KERNEL_IMAGE: &str = "vmlinuz-linux";

/// Initramfs placed in the boot destination.
pub const INITRAMFS_IMAGE: &str = "initramfs-linux.img";
