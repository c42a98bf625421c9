pub mod sop;
