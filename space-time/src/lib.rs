//! An [`Allocator`](allocator::Allocator) implementation that supports cheap, point-in-time
//! snapshots.
//!
//! Every object inserted through [`SpaceTime::insert`]/[`SpaceTime::insert_array`] lives in a
//! [`table::Table`] keyed by its Rust type ([`typemap::TableTypeMap`]/
//! [`typemap::ArrayStorageTypeMap`]). Tables are reference-counted slabs: cloning a pointer into
//! one bumps a reference count instead of copying the value, and mutating through a shared
//! pointer clones on write. [`SpaceTime::make_snapshot`] exploits this by recording, for every
//! live id, a cloned (ref-bumped) pointer into a [`snapshot::Snapshot`] — the snapshot itself
//! costs one bump per live id, never a copy of the underlying data.

pub mod allocator;
pub mod errors;
mod array_storage;
mod ids;
mod snapshot;
mod table;
mod typemap;

use std::marker::PhantomData;
use std::ops::{Bound, RangeBounds};

use generational_arena::{Arena, Index};

use allocator::{Allocator, ArrayAccessor, ArrayAccessorMut};
use array_storage::{ArrayStorage, Instance};
use errors::{InvalidIdError, InvalidSnapshotIdError};
pub use ids::SpaceTimeId;
use snapshot::{Snapshot, TypedInstance, TypedTablePtr};
use table::TableTrait;
use typemap::{ArrayStorageTypeMap, TableTypeMap};

/// Identifies a point-in-time snapshot taken with [`SpaceTime::make_snapshot`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId(Index);

/// An [`Allocator`] whose state can be snapshotted and restored at low cost.
#[derive(Debug, Default)]
pub struct SpaceTime {
    tables: TableTypeMap,
    arrays: ArrayStorageTypeMap,
    current_table_ptrs: Arena<TypedTablePtr>,
    current_instances: Arena<TypedInstance>,
    snapshots: Arena<Snapshot>,
}

impl SpaceTime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current state as a new snapshot, returning its id.
    ///
    /// This only bumps a reference count for every currently live id; it never copies the data
    /// those ids point to.
    pub fn make_snapshot(&mut self) -> SnapshotId {
        let mut table_ptrs = Vec::with_capacity(self.current_table_ptrs.len());
        for (_, typed) in self.current_table_ptrs.iter() {
            let table = self
                .tables
                .get_with_id_mut(typed.type_id)
                .expect("every live id must have a backing table");
            table_ptrs.push(TypedTablePtr {
                table_ptr: table.clone_table_ptr(&typed.table_ptr),
                type_id: typed.type_id,
            });
        }

        let mut instances = Vec::with_capacity(self.current_instances.len());
        for (_, typed) in self.current_instances.iter() {
            let storage = self
                .arrays
                .get_with_id_mut(typed.type_id)
                .expect("every live array id must have a backing storage");
            instances.push(TypedInstance {
                instance: storage.clone_instance(&typed.instance),
                type_id: typed.type_id,
            });
        }

        let snapshot = Snapshot::from_iterators(table_ptrs.into_iter(), instances.into_iter());
        SnapshotId(self.snapshots.insert(snapshot))
    }

    /// Discards the current state and restores the state recorded in `snapshot_id`.
    ///
    /// The snapshot itself is left intact and can be checked out again later.
    pub fn checkout(&mut self, snapshot_id: SnapshotId) -> Result<(), InvalidSnapshotIdError> {
        let snapshot = self
            .snapshots
            .get(snapshot_id.0)
            .ok_or(InvalidSnapshotIdError)?;

        let mut new_table_ptrs = Arena::with_capacity(snapshot.table_ptrs_len());
        for typed in snapshot.iter_table_ptrs() {
            let table = self
                .tables
                .get_with_id_mut(typed.type_id)
                .expect("every snapshotted id must have a backing table");
            new_table_ptrs.insert(TypedTablePtr {
                table_ptr: table.clone_table_ptr(&typed.table_ptr),
                type_id: typed.type_id,
            });
        }

        let mut new_instances = Arena::with_capacity(snapshot.instances_len());
        for typed in snapshot.iter_instances() {
            let storage = self
                .arrays
                .get_with_id_mut(typed.type_id)
                .expect("every snapshotted array id must have a backing storage");
            new_instances.insert(TypedInstance {
                instance: storage.clone_instance(&typed.instance),
                type_id: typed.type_id,
            });
        }

        let old_table_ptrs = std::mem::replace(&mut self.current_table_ptrs, new_table_ptrs);
        for typed in old_table_ptrs {
            let table = self
                .tables
                .get_with_id_mut(typed.type_id)
                .expect("every live id must have a backing table");
            table.drop_table_ptr(typed.table_ptr);
        }

        let old_instances = std::mem::replace(&mut self.current_instances, new_instances);
        for typed in old_instances {
            let storage = self
                .arrays
                .get_with_id_mut(typed.type_id)
                .expect("every live array id must have a backing storage");
            storage.drop_instance(typed.instance);
        }

        Ok(())
    }

    /// Drops a snapshot, releasing whatever state it alone was keeping alive.
    pub fn drop_snapshot(&mut self, snapshot_id: SnapshotId) -> Result<(), InvalidSnapshotIdError> {
        let snapshot = self
            .snapshots
            .remove(snapshot_id.0)
            .ok_or(InvalidSnapshotIdError)?;

        let (table_ptrs, instances) = snapshot.into_iterators();
        for typed in table_ptrs {
            let table = self
                .tables
                .get_with_id_mut(typed.type_id)
                .expect("every snapshotted id must have a backing table");
            table.drop_table_ptr(typed.table_ptr);
        }
        for typed in instances {
            let storage = self
                .arrays
                .get_with_id_mut(typed.type_id)
                .expect("every snapshotted array id must have a backing storage");
            storage.drop_instance(typed.instance);
        }

        Ok(())
    }
}

impl Allocator for SpaceTime {
    type Id<T> = SpaceTimeId<T, false>;
    type ArrayId<T> = SpaceTimeId<T, true>;

    fn insert<T: Clone + 'static>(&mut self, object: T) -> Self::Id<T> {
        let (type_id, table) = self.tables.get_or_default_mut::<T>();
        let table_ptr = table.add_item(object);
        let index = self
            .current_table_ptrs
            .insert(TypedTablePtr { table_ptr, type_id });
        SpaceTimeId::new(index)
    }

    fn insert_array<T: Copy + 'static>(&mut self, object: T, n: usize) -> Self::ArrayId<T> {
        let (type_id, storage) = self.arrays.get_or_default_mut::<T>();
        let instance = storage.new_instance(object, n as u64);
        let index = self
            .current_instances
            .insert(TypedInstance { instance, type_id });
        SpaceTimeId::new(index)
    }

    fn remove<T: Clone + 'static>(&mut self, id: Self::Id<T>) -> Result<(), InvalidIdError> {
        let typed = self
            .current_table_ptrs
            .remove(id.index)
            .ok_or(InvalidIdError)?;
        let table = self
            .tables
            .get_mut::<T>()
            .expect("table must exist for a live id");
        table.drop_table_ptr(typed.table_ptr);
        Ok(())
    }

    fn remove_array<T: Copy + 'static>(&mut self, id: Self::ArrayId<T>) -> Result<(), InvalidIdError> {
        let typed = self
            .current_instances
            .remove(id.index)
            .ok_or(InvalidIdError)?;
        let storage = self
            .arrays
            .get_mut::<T>()
            .expect("array storage must exist for a live id");
        storage.remove_instance(typed.instance);
        Ok(())
    }

    fn pop<T: Clone + 'static>(&mut self, id: Self::Id<T>) -> Result<T, InvalidIdError> {
        let typed = self
            .current_table_ptrs
            .remove(id.index)
            .ok_or(InvalidIdError)?;
        let table = self
            .tables
            .get_mut::<T>()
            .expect("table must exist for a live id");
        Ok(table.pop_or_get_item(typed.table_ptr))
    }

    fn get<T: Clone + 'static>(&self, id: Self::Id<T>) -> Result<&T, InvalidIdError> {
        let typed = self
            .current_table_ptrs
            .get(id.index)
            .ok_or(InvalidIdError)?;
        let table = self
            .tables
            .get::<T>()
            .expect("table must exist for a live id");
        Ok(table.get_item(&typed.table_ptr))
    }

    fn get_array<'a, T: 'a + Copy + 'static>(
        &'a self,
        id: Self::ArrayId<T>,
    ) -> Result<impl ArrayAccessor<'a, T>, InvalidIdError> {
        let typed = self
            .current_instances
            .get(id.index)
            .ok_or(InvalidIdError)?;
        let storage = self
            .arrays
            .get::<T>()
            .expect("array storage must exist for a live id");
        Ok(SpaceTimeArrayAccessor {
            storage,
            instance: &typed.instance,
        })
    }

    fn get_mut<T: Clone + 'static>(&mut self, id: Self::Id<T>) -> Result<&mut T, InvalidIdError> {
        let typed = self
            .current_table_ptrs
            .get_mut(id.index)
            .ok_or(InvalidIdError)?;
        let table = self
            .tables
            .get_mut::<T>()
            .expect("table must exist for a live id");
        if !table.is_unique_table_ptr(&typed.table_ptr) {
            typed.table_ptr = table.clone_item(typed.table_ptr.unsafe_clone(), T::clone);
        }
        Ok(table
            .get_item_mut(&typed.table_ptr)
            .expect("table_ptr was just made unique"))
    }

    fn get_array_mut<'a, T: 'a + Copy + 'static>(
        &'a mut self,
        id: Self::ArrayId<T>,
    ) -> Result<impl ArrayAccessorMut<'a, T>, InvalidIdError> {
        let typed = self
            .current_instances
            .get_mut(id.index)
            .ok_or(InvalidIdError)?;
        let storage = self
            .arrays
            .get_mut::<T>()
            .expect("array storage must exist for a live id");
        Ok(SpaceTimeArrayAccessorMut {
            storage: storage as *mut ArrayStorage<T>,
            instance: &mut typed.instance as *mut Instance,
            _marker: PhantomData,
        })
    }
}

struct SpaceTimeArrayAccessor<'a, T: Copy + 'static> {
    storage: &'a ArrayStorage<T>,
    instance: &'a Instance,
}

impl<'a, T: 'a + Copy + 'static> ArrayAccessor<'a, T> for SpaceTimeArrayAccessor<'a, T> {
    fn len(&self) -> usize {
        self.instance.len() as usize
    }

    fn get(&self, index: usize) -> Option<T> {
        self.instance.get(self.storage, index as u64).copied()
    }

    fn get_ref(&self, index: usize) -> Option<&'a T> {
        self.instance.get(self.storage, index as u64)
    }

    fn read(&self, buf: &mut [T], index: usize) -> bool {
        self.instance.read(self.storage, buf, index as u64)
    }

    fn iter_range<R>(&self, index_range: R) -> Option<impl IntoIterator<Item = &'a T> + 'a>
    where
        R: RangeBounds<usize>,
    {
        let (start, len) = resolve_range(index_range, self.len())?;
        self.instance.iter_range(self.storage, start as u64, len as u64)
    }
}

/// Accessor returned by [`SpaceTime::get_array_mut`].
///
/// Holds raw pointers instead of a `&mut` borrow so that [`ArrayAccessorMut::get_mut`] can hand
/// out independent `&mut T` references without re-borrowing `self` for every call. The pointers
/// are only ever dereferenced for the lifetime `'a` the accessor itself was bound to, which ties
/// them back to the original `&'a mut SpaceTime` borrow.
struct SpaceTimeArrayAccessorMut<'a, T: Copy + 'static> {
    storage: *mut ArrayStorage<T>,
    instance: *mut Instance,
    _marker: PhantomData<&'a mut (ArrayStorage<T>, Instance)>,
}

impl<'a, T: Copy + 'static> SpaceTimeArrayAccessorMut<'a, T> {
    fn storage_mut(&self) -> &'a mut ArrayStorage<T> {
        // Safety: the pointer was derived from a `&'a mut ArrayStorage<T>` and this accessor
        // cannot outlive `'a`; no other accessor into the same `SpaceTime` can exist at the
        // same time since it was borrowed from `&'a mut self`.
        unsafe { &mut *self.storage }
    }

    fn instance_mut(&self) -> &'a mut Instance {
        // Safety: see `storage_mut`.
        unsafe { &mut *self.instance }
    }
}

impl<'a, T: 'a + Copy + 'static> ArrayAccessor<'a, T> for SpaceTimeArrayAccessorMut<'a, T> {
    fn len(&self) -> usize {
        self.instance_mut().len() as usize
    }

    fn get(&self, index: usize) -> Option<T> {
        self.instance_mut().get(self.storage_mut(), index as u64).copied()
    }

    fn get_ref(&self, index: usize) -> Option<&'a T> {
        self.instance_mut().get(self.storage_mut(), index as u64)
    }

    fn read(&self, buf: &mut [T], index: usize) -> bool {
        self.instance_mut().read(self.storage_mut(), buf, index as u64)
    }

    fn iter_range<R>(&self, index_range: R) -> Option<impl IntoIterator<Item = &'a T> + 'a>
    where
        R: RangeBounds<usize>,
    {
        let (start, len) = resolve_range(index_range, self.len())?;
        self.instance_mut()
            .iter_range(self.storage_mut(), start as u64, len as u64)
    }
}

impl<'a, T: 'a + Copy + 'static> ArrayAccessorMut<'a, T> for SpaceTimeArrayAccessorMut<'a, T> {
    fn get_mut(&self, index: usize) -> Option<&'a mut T> {
        self.instance_mut().get_mut(self.storage_mut(), index as u64)
    }

    fn set(&self, index: usize, value: T) -> bool {
        self.write(index, std::slice::from_ref(&value))
    }

    fn write(&self, index: usize, buf: &[T]) -> bool {
        self.instance_mut().write(self.storage_mut(), index as u64, buf)
    }

    fn iter_range_mut<R>(&self, index_range: R) -> Option<impl IntoIterator<Item = &'a mut T> + 'a>
    where
        R: RangeBounds<usize>,
    {
        let (start, len) = resolve_range(index_range, self.len())?;
        let items: Vec<&'a mut T> = (start..start + len).map(|i| self.get_mut(i).unwrap()).collect();
        Some(items)
    }
}

fn resolve_range<R: RangeBounds<usize>>(range: R, len: usize) -> Option<(usize, usize)> {
    let start = match range.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s + 1,
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&e) => e + 1,
        Bound::Excluded(&e) => e,
        Bound::Unbounded => len,
    };
    if start > end || end > len {
        return None;
    }
    Some((start, end - start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_and_mutate() {
        let mut space_time = SpaceTime::new();
        let id = space_time.insert(42u32);
        assert_eq!(*space_time.get(id).unwrap(), 42);

        *space_time.get_mut(id).unwrap() = 7;
        assert_eq!(*space_time.get(id).unwrap(), 7);
    }

    #[test]
    fn snapshot_isolates_mutation() {
        let mut space_time = SpaceTime::new();
        let id = space_time.insert(1u32);

        let snapshot = space_time.make_snapshot();
        *space_time.get_mut(id).unwrap() = 2;
        assert_eq!(*space_time.get(id).unwrap(), 2);

        space_time.checkout(snapshot).unwrap();
        assert_eq!(*space_time.get(id).unwrap(), 1);

        space_time.drop_snapshot(snapshot).unwrap();
    }

    #[test]
    fn remove_invalidates_id() {
        let mut space_time = SpaceTime::new();
        let id = space_time.insert(5u32);
        space_time.remove(id).unwrap();
        assert!(space_time.get(id).is_err());
    }

    #[test]
    fn array_read_write_and_snapshot() {
        let mut space_time = SpaceTime::new();
        let id = space_time.insert_array(0u32, 128);

        {
            let accessor = space_time.get_array_mut(id).unwrap();
            assert!(accessor.write(4, &[1, 2, 3]));
        }

        let snapshot = space_time.make_snapshot();

        {
            let accessor = space_time.get_array_mut(id).unwrap();
            assert!(accessor.write(4, &[9, 9, 9]));
        }
        assert_eq!(space_time.get_array(id).unwrap().get(5), Some(9));

        space_time.checkout(snapshot).unwrap();
        assert_eq!(space_time.get_array(id).unwrap().get(5), Some(2));

        space_time.drop_snapshot(snapshot).unwrap();
    }
}
