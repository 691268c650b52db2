//! Named, typed, versioned device buffers.
//!
//! The registry is the single owner of every device buffer the simulator
//! uses. Each buffer carries a version: the global tick at which its content
//! last changed. External readers compare versions to decide what to
//! re-fetch, so versions never decrease.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::{read_typed, BufferHandle, ComputeDevice};
use crate::error::SimError;
use crate::Result;

/// Every buffer the simulator knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferName {
    // Point set
    Positions,
    PointSizes,
    PointColors,
    PointDegrees,
    PointForces,
    PrevForces,
    Swings,
    Tractions,
    SelectionMask,
    // Edge set
    ForwardEdges,
    ForwardWorkItems,
    ForwardWeights,
    BackwardEdges,
    BackwardWorkItems,
    BackwardWeights,
    // Barnes-Hut tree
    XCoords,
    YCoords,
    Mass,
    Children,
    Start,
    Sort,
    Count,
    GlobalXMins,
    GlobalXMaxs,
    GlobalYMins,
    GlobalYMaxs,
    GlobalSwings,
    GlobalTractions,
    Blocked,
    Step,
    Bottom,
    MaxDepth,
    Radius,
    GlobalSpeed,
}

impl BufferName {
    pub const POINT: &'static [BufferName] = &[
        Self::Positions,
        Self::PointSizes,
        Self::PointColors,
        Self::PointDegrees,
        Self::PointForces,
        Self::PrevForces,
        Self::Swings,
        Self::Tractions,
        Self::SelectionMask,
    ];

    pub const EDGE: &'static [BufferName] = &[
        Self::ForwardEdges,
        Self::ForwardWorkItems,
        Self::ForwardWeights,
        Self::BackwardEdges,
        Self::BackwardWorkItems,
        Self::BackwardWeights,
    ];

    pub const TREE: &'static [BufferName] = &[
        Self::XCoords,
        Self::YCoords,
        Self::Mass,
        Self::Children,
        Self::Start,
        Self::Sort,
        Self::Count,
        Self::GlobalXMins,
        Self::GlobalXMaxs,
        Self::GlobalYMins,
        Self::GlobalYMaxs,
        Self::GlobalSwings,
        Self::GlobalTractions,
        Self::Blocked,
        Self::Step,
        Self::Bottom,
        Self::MaxDepth,
        Self::Radius,
        Self::GlobalSpeed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Positions => "positions",
            Self::PointSizes => "point_sizes",
            Self::PointColors => "point_colors",
            Self::PointDegrees => "point_degrees",
            Self::PointForces => "point_forces",
            Self::PrevForces => "prev_forces",
            Self::Swings => "swings",
            Self::Tractions => "tractions",
            Self::SelectionMask => "selection_mask",
            Self::ForwardEdges => "forward_edges",
            Self::ForwardWorkItems => "forward_work_items",
            Self::ForwardWeights => "forward_weights",
            Self::BackwardEdges => "backward_edges",
            Self::BackwardWorkItems => "backward_work_items",
            Self::BackwardWeights => "backward_weights",
            Self::XCoords => "x_coords",
            Self::YCoords => "y_coords",
            Self::Mass => "mass",
            Self::Children => "children",
            Self::Start => "start",
            Self::Sort => "sort",
            Self::Count => "count",
            Self::GlobalXMins => "global_x_mins",
            Self::GlobalXMaxs => "global_x_maxs",
            Self::GlobalYMins => "global_y_mins",
            Self::GlobalYMaxs => "global_y_maxs",
            Self::GlobalSwings => "global_swings",
            Self::GlobalTractions => "global_tractions",
            Self::Blocked => "blocked",
            Self::Step => "step",
            Self::Bottom => "bottom",
            Self::MaxDepth => "max_depth",
            Self::Radius => "radius",
            Self::GlobalSpeed => "global_speed",
        }
    }
}

impl fmt::Display for BufferName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BufferName {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        Self::POINT
            .iter()
            .chain(Self::EDGE)
            .chain(Self::TREE)
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| SimError::invalid(format!("unknown buffer name '{s}'")))
    }
}

/// Element type of a buffer. All elements are 32 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    F32,
    U32,
    I32,
}

impl ElementType {
    pub const fn size(self) -> u64 {
        match self {
            Self::F32 | Self::U32 | Self::I32 => 4,
        }
    }
}

/// A live buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferDescriptor {
    pub name: BufferName,
    pub element: ElementType,
    /// Element count.
    pub len: u64,
    pub byte_len: u64,
    #[serde(skip)]
    pub handle: BufferHandle,
    pub version: u64,
}

/// Request to allocate one named buffer with optional initial content.
#[derive(Debug, Clone)]
pub struct BufferSpec {
    pub name: BufferName,
    pub element: ElementType,
    pub len: u64,
    pub contents: Option<Vec<u8>>,
}

impl BufferSpec {
    /// A zero-filled buffer of `len` elements.
    pub fn zeroed(name: BufferName, element: ElementType, len: usize) -> Self {
        Self {
            name,
            element,
            len: len as u64,
            contents: None,
        }
    }

    /// A buffer initialized from `data`.
    pub fn with_contents<T: bytemuck::Pod>(name: BufferName, element: ElementType, data: &[T]) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        Self {
            name,
            element,
            len: bytes.len() as u64 / element.size(),
            contents: Some(bytes.to_vec()),
        }
    }

    /// A buffer of `len` copies of `value`.
    pub fn filled<T: bytemuck::Pod>(name: BufferName, element: ElementType, len: usize, value: T) -> Self {
        Self::with_contents(name, element, &vec![value; len])
    }

    pub fn byte_len(&self) -> u64 {
        self.len * self.element.size()
    }
}

/// Buffer versions as seen by external readers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Versions {
    pub tick: u64,
    pub buffers: BTreeMap<BufferName, u64>,
}

impl Versions {
    pub fn get(&self, name: BufferName) -> Option<u64> {
        self.buffers.get(&name).copied()
    }
}

/// Owner of all named device buffers.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    buffers: HashMap<BufferName, BufferDescriptor>,
    versions: Versions,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate (or reallocate) a single buffer.
    pub fn allocate<D: ComputeDevice>(&mut self, device: &mut D, spec: BufferSpec) -> Result<BufferHandle> {
        let name = spec.name;
        self.install(device, vec![spec])?;
        self.handle(name)
    }

    /// Allocate and fill every spec, then swap them in together.
    ///
    /// If any allocation or upload fails the buffers created so far are
    /// released and the registry is left exactly as it was. On success the
    /// replaced buffers are released and every installed name is versioned
    /// at a fresh tick.
    pub fn install<D: ComputeDevice>(&mut self, device: &mut D, specs: Vec<BufferSpec>) -> Result<u64> {
        let mut staged = Vec::with_capacity(specs.len());
        for spec in specs {
            match create_and_fill(device, &spec) {
                Ok(handle) => staged.push((spec, handle)),
                Err(e) => {
                    warn!(buffer = %spec.name, error = %e, "allocation failed, rolling back");
                    for (_, handle) in staged {
                        if let Err(release) = device.release_buffer(handle) {
                            warn!(error = %release, "release during rollback failed");
                        }
                    }
                    return Err(e);
                }
            }
        }

        let tick = self.next_tick();
        for (spec, handle) in staged {
            let descriptor = BufferDescriptor {
                name: spec.name,
                element: spec.element,
                len: spec.len,
                byte_len: spec.byte_len(),
                handle,
                version: tick,
            };
            if let Some(old) = self.buffers.insert(spec.name, descriptor) {
                debug!(buffer = %spec.name, handle = old.handle.id(), "releasing replaced buffer");
                device.release_buffer(old.handle)?;
            }
            self.versions.buffers.insert(spec.name, tick);
        }
        Ok(tick)
    }

    pub fn get(&self, name: BufferName) -> Result<&BufferDescriptor> {
        self.buffers.get(&name).ok_or(SimError::BufferNotFound(name))
    }

    pub fn handle(&self, name: BufferName) -> Result<BufferHandle> {
        self.get(name).map(|descriptor| descriptor.handle)
    }

    pub fn contains(&self, name: BufferName) -> bool {
        self.buffers.contains_key(&name)
    }

    /// Look up the descriptor owning `handle`.
    pub fn find(&self, handle: BufferHandle) -> Option<&BufferDescriptor> {
        self.buffers.values().find(|descriptor| descriptor.handle == handle)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &BufferDescriptor> {
        self.buffers.values()
    }

    pub fn handles(&self) -> Vec<BufferHandle> {
        let mut handles: Vec<_> = self.buffers.values().map(|d| d.handle).collect();
        handles.sort();
        handles
    }

    /// Release a buffer and forget its version.
    pub fn delete<D: ComputeDevice>(&mut self, device: &mut D, name: BufferName) -> Result<()> {
        let descriptor = self.buffers.remove(&name).ok_or(SimError::BufferNotFound(name))?;
        self.versions.buffers.remove(&name);
        debug!(buffer = %name, handle = descriptor.handle.id(), "deleted buffer");
        device.release_buffer(descriptor.handle)
    }

    /// Release every named buffer that exists and bump the released names.
    pub fn reset<D: ComputeDevice>(&mut self, device: &mut D, names: &[BufferName]) -> Result<u64> {
        let mut released = Vec::with_capacity(names.len());
        for &name in names {
            if let Some(descriptor) = self.buffers.remove(&name) {
                device.release_buffer(descriptor.handle)?;
                released.push(name);
            }
        }
        debug!(count = released.len(), "reset buffers");
        Ok(self.bump(&released, None))
    }

    /// Advance the versions of `names` to `tick`, or to a fresh tick.
    ///
    /// Versions only move forward: bumping to an older tick is a no-op for
    /// buffers that are already newer.
    pub fn bump(&mut self, names: &[BufferName], tick: Option<u64>) -> u64 {
        let tick = match tick {
            Some(tick) => {
                self.versions.tick = self.versions.tick.max(tick);
                tick
            }
            None => self.next_tick(),
        };
        for &name in names {
            let version = self.versions.buffers.entry(name).or_insert(0);
            *version = (*version).max(tick);
            if let Some(descriptor) = self.buffers.get_mut(&name) {
                descriptor.version = *version;
            }
        }
        tick
    }

    pub fn versions(&self) -> &Versions {
        &self.versions
    }

    pub fn tick(&self) -> u64 {
        self.versions.tick
    }

    /// Overwrite the start of an existing buffer. Does not bump.
    pub fn write<D, T>(&self, device: &mut D, name: BufferName, data: &[T]) -> Result<()>
    where
        D: ComputeDevice,
        T: bytemuck::Pod,
    {
        let descriptor = self.get(name)?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > descriptor.byte_len {
            return Err(SimError::invalid(format!(
                "{} bytes do not fit {name} ({} bytes)",
                bytes.len(),
                descriptor.byte_len
            )));
        }
        device.write_buffer(descriptor.handle, 0, bytes)
    }

    pub async fn read<D, T>(&self, device: &mut D, name: BufferName) -> Result<Vec<T>>
    where
        D: ComputeDevice,
        T: bytemuck::Pod,
    {
        let descriptor = self.get(name)?;
        let mut values: Vec<T> = read_typed(device, descriptor.handle).await?;
        let len = (descriptor.byte_len as usize) / std::mem::size_of::<T>().max(1);
        values.truncate(len);
        Ok(values)
    }

    fn next_tick(&mut self) -> u64 {
        self.versions.tick += 1;
        self.versions.tick
    }
}

fn create_and_fill<D: ComputeDevice>(device: &mut D, spec: &BufferSpec) -> Result<BufferHandle> {
    let handle = device.create_buffer(spec.name.as_str(), spec.byte_len())?;
    if let Some(contents) = &spec.contents {
        if let Err(e) = device.write_buffer(handle, 0, contents) {
            let _ = device.release_buffer(handle);
            return Err(e);
        }
    }
    debug!(buffer = %spec.name, bytes = spec.byte_len(), handle = handle.id(), "allocated buffer");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuDevice;

    fn spec(name: BufferName, len: usize) -> BufferSpec {
        BufferSpec::zeroed(name, ElementType::F32, len)
    }

    #[test]
    fn test_get_missing() {
        let registry = BufferRegistry::new();
        assert!(matches!(
            registry.get(BufferName::Positions),
            Err(SimError::BufferNotFound(BufferName::Positions))
        ));
    }

    #[test]
    fn test_reallocate_releases_old() {
        let mut device = CpuDevice::new();
        let mut registry = BufferRegistry::new();

        let first = registry.allocate(&mut device, spec(BufferName::Positions, 8)).unwrap();
        let second = registry.allocate(&mut device, spec(BufferName::Positions, 16)).unwrap();

        assert_ne!(first, second);
        assert_eq!(device.live_buffers(), vec![second]);
        assert_eq!(registry.get(BufferName::Positions).unwrap().byte_len, 64);
        assert_eq!(registry.versions().get(BufferName::Positions), Some(2));
    }

    #[test]
    fn test_install_is_atomic() {
        let mut device = CpuDevice::new().with_memory_limit(1024);
        let mut registry = BufferRegistry::new();
        registry.allocate(&mut device, spec(BufferName::Positions, 16)).unwrap();
        let before = registry.versions().clone();
        let live = device.live_buffers();

        let result = registry.install(
            &mut device,
            vec![spec(BufferName::Positions, 32), spec(BufferName::Mass, 4096)],
        );

        assert!(matches!(result, Err(SimError::Allocation { .. })));
        assert_eq!(registry.versions(), &before);
        assert_eq!(device.live_buffers(), live);
        assert_eq!(registry.get(BufferName::Positions).unwrap().len, 16);
        assert!(!registry.contains(BufferName::Mass));
    }

    #[test]
    fn test_bump_never_decreases() {
        let mut registry = BufferRegistry::new();
        registry.bump(&[BufferName::Positions], Some(10));
        registry.bump(&[BufferName::Positions], Some(4));
        assert_eq!(registry.versions().get(BufferName::Positions), Some(10));
        assert_eq!(registry.tick(), 10);

        let fresh = registry.bump(&[BufferName::Positions], None);
        assert_eq!(fresh, 11);
        assert_eq!(registry.versions().get(BufferName::Positions), Some(11));
    }

    #[test]
    fn test_delete_and_reset() {
        let mut device = CpuDevice::new();
        let mut registry = BufferRegistry::new();
        registry.allocate(&mut device, spec(BufferName::Positions, 4)).unwrap();
        registry.allocate(&mut device, spec(BufferName::Mass, 4)).unwrap();

        registry.delete(&mut device, BufferName::Mass).unwrap();
        assert!(registry.versions().get(BufferName::Mass).is_none());
        assert!(registry.delete(&mut device, BufferName::Mass).is_err());

        let tick = registry.reset(&mut device, &[BufferName::Positions]).unwrap();
        assert!(!registry.contains(BufferName::Positions));
        assert_eq!(registry.versions().get(BufferName::Positions), Some(tick));
        assert!(device.live_buffers().is_empty());
    }

    #[test]
    fn test_names_round_trip_through_str() {
        for name in BufferName::POINT.iter().chain(BufferName::EDGE).chain(BufferName::TREE) {
            assert_eq!(name.as_str().parse::<BufferName>().unwrap(), *name);
        }
        assert!("nope".parse::<BufferName>().is_err());
    }

    #[test]
    fn test_contents_written() {
        let mut device = CpuDevice::new();
        let mut registry = BufferRegistry::new();
        let data = [1.0f32, 2.0, 3.0];
        registry
            .allocate(
                &mut device,
                BufferSpec::with_contents(BufferName::PointSizes, ElementType::F32, &data),
            )
            .unwrap();

        let back: Vec<f32> =
            pollster::block_on(registry.read(&mut device, BufferName::PointSizes)).unwrap();
        assert_eq!(back, data);
    }
}
