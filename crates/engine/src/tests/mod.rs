mod helpers;

mod cursor_tests;
mod foreach_tests;
mod recovery_tests;
mod repack_tests;
