// Exposes the daemon's modules as a library target so the suites
// under tests/ can drive the miner, ledger and sync engine directly
// against scripted collaborators.
//
// Daemon-only items (Args, setup_logging, main itself) have no
// callers when built this way, so dead-code lints are silenced for
// the library build.
#![allow(dead_code)]

include!("./main.rs");
