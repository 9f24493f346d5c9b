//! In-memory process images and their on-disk dump format.
//!
//! A dump directory looks like this:
//!
//! ```text
//! image.json                  {"address_width": 8, "byte_order": "little"}
//! regions/7f3a00000000.rw.bin
//! regions/7f3a00200000.r.bin
//! ```
//!
//! Region files are named after their base address (hex) and permissions.
//! The manifest may carry a `layout` object overriding individual
//! [`LayoutConstants`] fields for images produced by a different runtime
//! build.

use super::{Address, AddressWidth, ByteOrder, ImageId, MemoryProvider, Region};
use crate::error::{Error, Result};
use crate::layout::LayoutConstants;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Name of the manifest file inside a dump directory
pub const MANIFEST_FILE: &str = "image.json";

/// Name of the directory holding region dumps
pub const REGIONS_DIR: &str = "regions";

/// One captured memory region
#[derive(Debug, Clone)]
pub struct ImageRegion {
    /// First address of the region
    pub base: Address,
    /// Whether the region was writable in the captured process
    pub writable: bool,
    /// Raw region contents
    pub data: Bytes,
}

impl ImageRegion {
    /// Creates a new region
    pub fn new(base: Address, writable: bool, data: impl Into<Bytes>) -> Self {
        Self {
            base,
            writable,
            data: data.into(),
        }
    }

    /// Address range covered by this region
    pub fn region(&self) -> Region {
        Region::new(self.base, self.data.len() as u64)
    }

    fn file_name(&self) -> String {
        let perms = if self.writable { "rw" } else { "r" };
        format!("{:x}.{}.bin", self.base, perms)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    address_width: AddressWidth,
    byte_order: ByteOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    layout: Option<LayoutConstants>,
}

/// A static snapshot of a process address space
#[derive(Debug, Clone)]
pub struct ProcessImage {
    regions: Vec<ImageRegion>,
    address_width: AddressWidth,
    byte_order: ByteOrder,
    layout: Option<LayoutConstants>,
    id: ImageId,
}

impl ProcessImage {
    /// Creates an image from a set of regions.
    ///
    /// Regions are sorted by base address; overlapping regions are rejected.
    pub fn new(
        address_width: AddressWidth,
        byte_order: ByteOrder,
        mut regions: Vec<ImageRegion>,
    ) -> Result<Self> {
        regions.sort_by_key(|r| r.base);

        for pair in regions.windows(2) {
            if pair[0].region().end() > pair[1].base {
                return Err(Error::invalid_target(format!(
                    "regions at 0x{:x} and 0x{:x} overlap",
                    pair[0].base, pair[1].base
                )));
            }
        }

        let id = fingerprint(address_width, byte_order, &regions, None);
        debug!("Created image {} with {} regions", id, regions.len());

        Ok(Self {
            regions,
            address_width,
            byte_order,
            layout: None,
            id,
        })
    }

    /// Attaches layout overrides to the image
    pub fn with_layout(mut self, layout: LayoutConstants) -> Self {
        self.id = fingerprint(
            self.address_width,
            self.byte_order,
            &self.regions,
            Some(&layout),
        );
        self.layout = Some(layout);
        self
    }

    /// Layout overrides carried by the image, if any
    pub fn layout_constants(&self) -> Option<&LayoutConstants> {
        self.layout.as_ref()
    }

    /// All regions, writable or not
    pub fn regions(&self) -> &[ImageRegion] {
        &self.regions
    }

    /// Loads an image from a dump directory
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = fs::read(&manifest_path).map_err(|e| Error::file_read(&manifest_path, e))?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| Error::invalid_manifest(&manifest_path, e.to_string()))?;

        let regions_dir = dir.join(REGIONS_DIR);
        let mut regions = Vec::new();

        for entry in WalkDir::new(&regions_dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
        {
            let entry = entry.map_err(|e| {
                Error::invalid_manifest(&regions_dir, format!("cannot list regions: {}", e))
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }

            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let Some((base, writable)) = parse_region_name(name) else {
                trace!("Skipping unrecognized region file {}", path.display());
                continue;
            };

            let data = fs::read(path).map_err(|e| Error::file_read(path, e))?;
            trace!("Loaded region 0x{:x} ({} bytes)", base, data.len());
            regions.push(ImageRegion::new(base, writable, data));
        }

        let image = Self::new(manifest.address_width, manifest.byte_order, regions)?;
        Ok(match manifest.layout {
            Some(layout) => image.with_layout(layout),
            None => image,
        })
    }

    /// Writes the image to a dump directory
    pub fn save_dir(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let regions_dir = dir.join(REGIONS_DIR);
        fs::create_dir_all(&regions_dir).map_err(|e| Error::file_write(&regions_dir, e))?;

        let manifest = Manifest {
            address_width: self.address_width,
            byte_order: self.byte_order,
            layout: self.layout.clone(),
        };
        let manifest_path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&manifest_path, json).map_err(|e| Error::file_write(&manifest_path, e))?;

        for region in &self.regions {
            let path = regions_dir.join(region.file_name());
            fs::write(&path, &region.data).map_err(|e| Error::file_write(&path, e))?;
        }

        Ok(())
    }

    fn region_for(&self, address: Address) -> Option<&ImageRegion> {
        let idx = self.regions.partition_point(|r| r.base <= address);
        let region = self.regions.get(idx.checked_sub(1)?)?;
        region.region().contains(address).then_some(region)
    }
}

impl MemoryProvider for ProcessImage {
    fn writable_regions(&self) -> Vec<Region> {
        self.regions
            .iter()
            .filter(|r| r.writable)
            .map(ImageRegion::region)
            .collect()
    }

    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> Result<()> {
        let region = self
            .region_for(address)
            .ok_or_else(|| Error::read(address, buf.len()))?;

        let start = (address - region.base) as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= region.data.len())
            .ok_or_else(|| Error::read(address, buf.len()))?;

        buf.copy_from_slice(&region.data[start..end]);
        Ok(())
    }

    fn address_width(&self) -> AddressWidth {
        self.address_width
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn identity(&self) -> ImageId {
        self.id.clone()
    }
}

/// Parse `<hex base>.<rw|r>.bin`
fn parse_region_name(name: &str) -> Option<(Address, bool)> {
    let stem = name.strip_suffix(".bin")?;
    let (base, perms) = stem.split_once('.')?;
    let base = u64::from_str_radix(base.trim_start_matches("0x"), 16).ok()?;
    let writable = match perms {
        "rw" => true,
        "r" => false,
        _ => return None,
    };
    Some((base, writable))
}

/// Short content hash over everything that affects decoding
fn fingerprint(
    width: AddressWidth,
    order: ByteOrder,
    regions: &[ImageRegion],
    layout: Option<&LayoutConstants>,
) -> ImageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[u8::from(width), order as u8]);
    for region in regions {
        hasher.update(&region.base.to_le_bytes());
        hasher.update(&[region.writable as u8]);
        hasher.update(&(region.data.len() as u64).to_le_bytes());
        hasher.update(&region.data);
    }
    // a struct of plain numbers always serializes
    if let Some(Ok(layout)) = layout.map(serde_json::to_vec) {
        hasher.update(&[1]);
        hasher.update(&layout);
    }
    ImageId::new(&hasher.finalize().to_hex()[..16])
}
