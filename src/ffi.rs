//! C ABI for model identification.
//!
//! Lets a host runtime decode identity payloads it read itself. Strings
//! returned here are owned by this library and must be released with
//! [`podprobe_string_free`].

use std::{
   ffi::{CString, c_char},
   ptr, slice,
};

use crate::airpods::model::identify;

/// Decodes `len` bytes at `bytes` into a display name.
///
/// A null `bytes` is treated as an empty payload. Returns null only if the
/// name cannot be represented as a C string.
///
/// # Safety
///
/// `bytes` must be null or point to `len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn podprobe_identify(bytes: *const u8, len: usize) -> *mut c_char {
   let payload = if bytes.is_null() {
      &[][..]
   } else {
      unsafe { slice::from_raw_parts(bytes, len) }
   };
   CString::new(identify(payload).to_string()).map_or(ptr::null_mut(), CString::into_raw)
}

/// Releases a string returned by [`podprobe_identify`].
///
/// # Safety
///
/// `name` must be null or a pointer obtained from this library that has
/// not been freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn podprobe_string_free(name: *mut c_char) {
   if !name.is_null() {
      unsafe { drop(CString::from_raw(name)) };
   }
}
