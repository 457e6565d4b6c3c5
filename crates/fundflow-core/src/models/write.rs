use rust_decimal::Decimal;

use super::AccountId;

#[derive(Debug, Clone, PartialEq)]
pub struct CreateAccountCommand {
    pub name: String,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateAccountCommand {
    pub id: AccountId,
    pub name: String,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendTransferCommand {
    pub sender_id: AccountId,
    pub receiver_id: AccountId,
    pub amount: Decimal,
}
