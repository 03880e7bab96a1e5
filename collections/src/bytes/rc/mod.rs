use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::{self, Layout};

/// A reference-counted memory block, shareable across threads.
///
/// This is the allocation that backs every cached [`Record`](crate::bytes); unlike an
/// ordinary `Arc<[u8]>` it carries no separate fat pointer — `len` lives in the same
/// allocation as the data, so a handle is a single machine word.
#[repr(transparent)]
pub struct Alloc {
	/// A pointer to the beginning of the data
	ptr: NonNull<u8>,
}

// SAFETY: the refcount is a real atomic and the payload is never mutated through a shared
// `&Alloc` once published; callers that need interior mutability use atomics of their own.
unsafe impl Send for Alloc {}
unsafe impl Sync for Alloc {}

/// Get the layout required to represent bytes of the specified length
unsafe fn layout(len: usize) -> Layout {
	Layout::from_size_align(size_of::<Meta>() + len, align_of::<Meta>()).unwrap()
}

impl Alloc {
	/// Create a new uninitialised allocation with the specified length
	pub fn uninit(len: usize) -> Self {
		unsafe {
			// The layout will never be zero-sized, since a `Meta` structure is always appended to the beginning of it.
			let ptr = alloc::alloc(layout(len));
			// The allocator API should never return a null pointer.
			Self::from_ptr(ptr, len)
		}
	}

	/// Create a new zeroed allocation with the specified length
	pub fn zeroed(len: usize) -> Self {
		unsafe {
			// The layout will never be zero-sized, since a `Meta` structure is always appended to the beginning of it.
			let ptr = alloc::alloc_zeroed(layout(len));
			// The allocator API should never return a null pointer.
			Self::from_ptr(ptr, len)
		}
	}

	/// Initialise an allocation's reference-counting block. `ptr` must be non-null.
	unsafe fn from_ptr(ptr: *mut u8, len: usize) -> Self {
		unsafe {
			// `ptr` must be non-null.
			let ptr = NonNull::new_unchecked(ptr);
			// Write in the allocation length and initial reference count, which is 1.
			ptr.cast::<Meta>().write(Meta { rc: AtomicUsize::new(1), len });
			// Return a new instance pointing to the data section of the allocation.
			Self { ptr: ptr.add(size_of::<Meta>()) }
		}
	}

	/// Returns the base data pointer. It will be valid for whatever `len` value was passed when it was created.
	pub fn base_ptr(&self) -> NonNull<u8> {
		self.ptr
	}

	/// Returns the number of data bytes in this allocation.
	pub fn len(&self) -> usize {
		unsafe { self.meta_ptr().as_ref().len }
	}

	/// Get a pointer to the reference counting block
	unsafe fn meta_ptr(&self) -> NonNull<Meta> {
		self.ptr.sub(size_of::<Meta>()).cast()
	}
}

impl Clone for Alloc {
	/// Increment the reference count on this block
	fn clone(&self) -> Self {
		// Relaxed is sufficient: new references are only ever derived from an existing one,
		// so there is no data being synchronized by the increment itself.
		let rc = unsafe { &self.meta_ptr().as_ref().rc };
		rc.fetch_add(1, Ordering::Relaxed);
		// Duplicate the pointer
		Self { ptr: self.ptr }
	}
}

impl Drop for Alloc {
	fn drop(&mut self) {
		// Get a pointer to the reference counting block
		let meta = unsafe { self.meta_ptr() };
		let Meta { rc, len } = unsafe { meta.as_ref() };

		// Release on the decrement, Acquire on the one that observes zero: the standard
		// Arc drop dance, so the final dropper sees every write made through earlier handles.
		if rc.fetch_sub(1, Ordering::Release) != 1 {
			return;
		}

		rc.load(Ordering::Acquire);

		// Deallocate the buffer if there are no remaining references to it
		unsafe { std::alloc::dealloc(meta.as_ptr() as _, layout(*len)) };
	}
}

struct Meta {
	/// The number of references to this memory block.
	rc: AtomicUsize,
	/// The number of bytes in this allocation after the end of the [Meta] section.
	len: usize,
}
