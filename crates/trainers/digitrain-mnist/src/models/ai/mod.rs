pub(crate) mod aggregate;
pub(crate) mod evaluate;
pub(crate) mod layers;
pub(crate) mod network;
pub(crate) mod optim;
pub(crate) mod trainer;
