pub mod analyzer;
pub mod approvals;
pub mod llm;

#[cfg(test)]
pub(crate) mod test_support;
