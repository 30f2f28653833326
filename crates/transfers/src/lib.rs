//! Stock transfers between two shops of the same pharmacy.
//!
//! The aggregate decides; the use-case moves stock out of the source shop and
//! into the destination shop in one transaction.

pub mod transfer;

pub use transfer::{
    AddTransferItem, CancelTransfer, NewStockTransfer, RemoveTransferItem, StockTransfer,
    StockTransferCommand, StockTransferEvent, StockTransferId, StockTransferItem,
    StockTransferItemId, StockTransferStatus, TransferCancelled, TransferItemAdded,
    TransferItemRemoved, TransferLine, TransferValidated, ValidateTransfer,
};
