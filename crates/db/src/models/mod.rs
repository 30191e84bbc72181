pub mod workflow;
pub mod workflow_event;

#[cfg(test)]
pub(crate) mod test_utils;
