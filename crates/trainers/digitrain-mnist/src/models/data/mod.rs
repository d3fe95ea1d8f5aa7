pub(crate) mod dataset;
pub(crate) mod iterator;
pub(crate) mod mnist;
