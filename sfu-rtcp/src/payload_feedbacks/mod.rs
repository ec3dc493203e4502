pub mod full_intra_request;
pub mod picture_loss_indication;
