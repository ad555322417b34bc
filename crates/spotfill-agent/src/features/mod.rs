pub mod termination_watch;
